//! Scaled-down rendition of the "100 000 random strings" scenario: the
//! shape (insert distinct random keys equal to their own value, overwrite
//! them all with a constant, delete them all) is what's under test, not
//! the literal count, so this runs with a count that keeps the suite fast.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashSet;
use tempfile::tempdir;

use cowkv::{bytes_from, Engine, Options, ReadOptions, WriteOptions};

const COUNT: usize = 3000;
const KEY_LEN: usize = 15;

fn random_string(rng: &mut StdRng) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    (0..KEY_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[test]
fn random_strings_insert_overwrite_delete() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("db"), Options::default()).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut keys = HashSet::with_capacity(COUNT);
    while keys.len() < COUNT {
        keys.insert(random_string(&mut rng));
    }
    let keys: Vec<String> = keys.into_iter().collect();

    for k in &keys {
        engine
            .put(WriteOptions::default(), bytes_from(k.as_bytes().to_vec()), bytes_from(k.as_bytes().to_vec()))
            .unwrap();
    }
    for k in &keys {
        let v = engine.get(ReadOptions::default(), k.as_bytes()).unwrap().unwrap();
        assert_eq!(v.as_ref(), k.as_bytes());
    }

    for k in &keys {
        engine
            .put(WriteOptions::default(), bytes_from(k.as_bytes().to_vec()), bytes_from(*b"cnm"))
            .unwrap();
    }
    for k in &keys {
        let v = engine.get(ReadOptions::default(), k.as_bytes()).unwrap().unwrap();
        assert_eq!(v.as_ref(), b"cnm".as_ref());
    }

    for k in &keys {
        engine.delete(WriteOptions::default(), bytes_from(k.as_bytes().to_vec())).unwrap();
    }
    for k in &keys {
        assert!(engine.get(ReadOptions::default(), k.as_bytes()).unwrap().is_none());
    }
}
