use tempfile::tempdir;

use cowkv::{bytes_from, Engine, Options, ReadOptions, WriteOptions};

const NAMES: &[&str] = &[
    "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten", "eleven",
];

#[test]
fn small_crud_round_trip() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("db"), Options::default()).unwrap();

    for (i, name) in (1..=11).zip(NAMES) {
        engine
            .put(WriteOptions::default(), bytes_from(i.to_string().into_bytes()), bytes_from(name.as_bytes().to_vec()))
            .unwrap();
    }

    for (i, name) in (1..=11).zip(NAMES) {
        let v = engine
            .get(ReadOptions::default(), i.to_string().as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(v.as_ref(), name.as_bytes());
    }

    for i in 1..=11 {
        engine
            .delete(WriteOptions::default(), bytes_from(i.to_string().into_bytes()))
            .unwrap();
    }

    for i in 1..=11 {
        assert!(engine
            .get(ReadOptions::default(), i.to_string().as_bytes())
            .unwrap()
            .is_none());
    }
}
