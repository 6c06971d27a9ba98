//! miIO payload encryption and packet checksums.
//! Payloads use AES-128-CBC with PKCS7 padding; key and IV are MD5 digests of
//! the device token.

use crate::error::{MiioError, Result};
use aes::Aes128;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use tokio::time::Instant;

const BLOCK: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// MD5 over the concatenation of `parts`.
pub fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// AES-128-CBC cipher keyed from a 16-byte device token.
#[derive(Clone)]
pub struct MiioCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl MiioCipher {
    /// key = MD5(token), iv = MD5(key || token)
    pub fn new(token: &[u8]) -> Result<Self> {
        if token.len() != 16 {
            return Err(MiioError::InvalidToken);
        }
        let key = md5(&[token]);
        let iv = md5(&[&key, token]);
        Ok(Self { key, iv })
    }

    /// Encrypt data, always PKCS7 padded to the block size.
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    /// Decrypt data and strip the PKCS7 padding.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(BLOCK) {
            return Err(MiioError::DecryptionFailed);
        }
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| MiioError::DecryptionFailed)
    }
}

/// Per-session cipher material: the token cipher plus the identity and stamp
/// the device reported during discovery.
#[derive(Clone)]
pub struct CipherContext {
    cipher: MiioCipher,
    token: [u8; 16],
    device_id: u32,
    stamp: u32,
    stamp_at: Instant,
}

impl CipherContext {
    pub fn new(token: &[u8; 16], device_id: u32, stamp: u32) -> Result<Self> {
        Ok(Self {
            cipher: MiioCipher::new(token)?,
            token: *token,
            device_id,
            stamp,
            stamp_at: Instant::now(),
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn token(&self) -> &[u8; 16] {
        &self.token
    }

    /// Re-anchors the stamp after a later handshake with the same device.
    pub fn resync(&mut self, device_id: u32, stamp: u32) {
        self.device_id = device_id;
        self.stamp = stamp;
        self.stamp_at = Instant::now();
    }

    /// Device stamp advanced by the seconds elapsed since discovery.
    pub fn fresh_stamp(&self) -> u32 {
        let elapsed = self.stamp_at.elapsed().as_secs() as u32;
        self.stamp.wrapping_add(elapsed)
    }

    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        self.cipher.encrypt(data)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.cipher.decrypt(data)
    }

    /// MD5(header[..16] || token || payload)
    pub fn checksum(&self, header: &[u8], payload: &[u8]) -> [u8; 16] {
        md5(&[&header[..16], &self.token, payload])
    }

    pub fn verify(&self, header: &[u8], payload: &[u8], checksum: &[u8]) -> Result<()> {
        if self.checksum(header, payload).as_slice() != checksum {
            return Err(MiioError::ChecksumMismatch);
        }
        Ok(())
    }
}
