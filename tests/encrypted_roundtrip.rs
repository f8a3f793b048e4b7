//! §8 scenario 6: open with a 64-byte key, write a large blob, close,
//! reopen with the same key and verify byte identity; reopening with the
//! wrong key must fail decryption.

use arcadb::arena::Arena;
use arcadb::config::{EncryptionKey, GrowthPolicy};
use arcadb::error::EngineError;

fn key(byte: u8) -> EncryptionKey {
    [byte; 64]
}

#[test]
fn round_trips_with_the_right_key_and_rejects_the_wrong_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("encrypted.db");
    let growth = GrowthPolicy::conservative();
    let data: Vec<u8> = (0..(1 << 20)).map(|i| (i % 251) as u8).collect();

    let write_key = key(0x42);
    let r;
    {
        let mut arena = Arena::create_encrypted(&path, &write_key, growth).unwrap();
        r = arena.alloc(data.len()).unwrap();
        arena.write(r, &data).unwrap();
        arena.flush().unwrap();
    }

    {
        let mut arena = Arena::create_encrypted(&path, &write_key, growth).unwrap();
        let back = arena.read(r, data.len()).unwrap();
        assert_eq!(back, data);
    }

    {
        let wrong_key = key(0x99);
        let result = Arena::create_encrypted(&path, &wrong_key, growth);
        assert!(matches!(result, Err(EngineError::DecryptionFailed(_))));
    }
}
