//! Symmetric group keys and authenticated encryption of Data frames (§4.2).
//!
//! Grounded on `keychain.py`'s `Keychain` class: two subkeys (`K_aes`,
//! `K_mac`) are derived from each stored secret with HMAC-SHA256, the
//! mutable header fields (`ttl`, the `Relayed` bit) are excluded from the
//! authenticated region so a relay can touch them without breaking the
//! MAC, and the padding length rides in the low nibble of the final tag
//! byte. The crypto primitives themselves follow the block-cipher-trait
//! style the teacher uses in `default_crypto.rs` (`aes::cipher::{BlockEncrypt,
//! BlockDecrypt, KeyInit}` driven block-by-block) rather than pulling in a
//! dedicated CBC-mode crate, since CBC here needs the same
//! canonicalize-then-MAC dance the teacher already hand-rolls for LoRaWAN's
//! CTR mode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac as HmacMac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::KeychainError;
use crate::message::flags;

type HmacSha256 = Hmac<Sha256>;

const AES_CONTEXT: &[u8] = b"AES14159265358979323846";
const MAC_CONTEXT: &[u8] = b"MAC26433832795028841971";

/// A loaded, ready-to-use key: the raw secret plus its two derived
/// subkeys, computed once at load time.
struct DerivedKey {
    aes_key: [u8; 16],
    mac_key: [u8; 32],
}

impl DerivedKey {
    fn derive(secret: &[u8]) -> Self {
        let aes_full = hmac_sha256(secret, AES_CONTEXT);
        let mut aes_key = [0u8; 16];
        aes_key.copy_from_slice(&aes_full[..16]);
        let mac_key = hmac_sha256(secret, MAC_CONTEXT);
        DerivedKey { aes_key, mac_key }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256_16(data: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

fn aes_cbc_encrypt(data: &mut [u8], key: &[u8; 16], iv: &[u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut prev = *iv;
    for chunk in data.chunks_mut(16) {
        for (b, p) in chunk.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        let block = GenericArray::from_mut_slice(chunk);
        cipher.encrypt_block(block);
        prev.copy_from_slice(chunk);
    }
}

fn aes_cbc_decrypt(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    let mut prev = *iv;
    for chunk in out.chunks_mut(16) {
        let ct = {
            let mut c = [0u8; 16];
            c[..chunk.len()].copy_from_slice(chunk);
            c
        };
        let block = GenericArray::from_mut_slice(chunk);
        cipher.decrypt_block(block);
        for (b, p) in chunk.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        prev = ct;
    }
    out
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

/// Loads and saves group keys from/to disk, and implements the
/// authenticated encryption/decryption of Data frames described in §4.2.
pub struct Keychain {
    dir: PathBuf,
    keys: HashMap<String, DerivedKey>,
}

impl Keychain {
    /// Open (creating if needed) the keychain directory and load all keys
    /// found in it. One file per key, filename = key name, content = raw
    /// secret bytes — matches `keychain.py`'s `keys/` directory layout.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut kc = Keychain { dir, keys: HashMap::new() };
        kc.reload()?;
        Ok(kc)
    }

    fn reload(&mut self) -> std::io::Result<()> {
        self.keys.clear();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let secret = std::fs::read(entry.path())?;
            self.keys.insert(name, DerivedKey::derive(&secret));
        }
        Ok(())
    }

    pub fn has_key(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }

    pub fn list_keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.keys.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn add_key(&mut self, name: &str, secret: &[u8]) -> std::io::Result<()> {
        std::fs::write(self.key_path(name), secret)?;
        self.keys.insert(name.to_string(), DerivedKey::derive(secret));
        Ok(())
    }

    pub fn del_key(&mut self, name: &str) -> std::io::Result<()> {
        let path = self.key_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        self.keys.remove(name);
        Ok(())
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Encrypt an already-encoded plaintext Data frame (§4.1) under the
    /// named key, producing the envelope described in §4.2. `plaintext`
    /// must be at least 14 bytes (the minimum Data header with a nonzero
    /// nick).
    pub fn encrypt(&self, plaintext: &[u8], key_name: &str) -> Result<Vec<u8>, KeychainError> {
        if plaintext.len() < 14 {
            return Err(KeychainError::PlaintextTooShort(plaintext.len()));
        }
        let key = self
            .keys
            .get(key_name)
            .ok_or_else(|| KeychainError::NoSuchKey(key_name.to_string()))?;

        let data_len = plaintext.len() - 7;
        let pad = (16 - data_len % 16) % 16;
        let out_len = 11 + data_len + pad + 10;
        let mut out = vec![0u8; out_len];

        out[0] = plaintext[0];
        out[1] = plaintext[1] & !flags::RELAYED & !flags::ENCRYPTED;
        out[2..6].copy_from_slice(&plaintext[2..6]);
        out[6] = 0;
        rand::thread_rng().fill_bytes(&mut out[7..11]);

        let iv = sha256_16(&out[0..11]);
        out[11..11 + data_len].copy_from_slice(&plaintext[7..7 + data_len]);

        let cipher_region_end = out_len - 10;
        aes_cbc_encrypt(&mut out[11..cipher_region_end], &key.aes_key, &iv);

        let tag = hmac_sha256(&key.mac_key, &out[..cipher_region_end]);
        out[cipher_region_end..].copy_from_slice(&tag[..10]);
        let last = out_len - 1;
        out[last] = (out[last] & 0xf0) | (pad as u8);

        // Restore the real (non-canonicalized) mutable header.
        out[1] = plaintext[1];
        out[6] = plaintext[6];

        Ok(out)
    }

    /// Try every known key against an encrypted frame. Returns the
    /// key name and the decrypted plaintext frame (with the *received*
    /// flags/ttl preserved) on success.
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<(String, Vec<u8>), KeychainError> {
        if encrypted.len() < 11 + 1 + 10 {
            return Err(KeychainError::CiphertextTooShort);
        }

        let mut canon = encrypted.to_vec();
        canon[1] &= !flags::RELAYED & !flags::ENCRYPTED;
        canon[6] = 0;
        let last = canon.len() - 1;
        let padlen = (canon[last] & 0x0f) as usize;
        canon[last] &= 0xf0;
        let received_tag = canon[canon.len() - 10..].to_vec();
        let mac_region_end = canon.len() - 10;

        for (name, key) in &self.keys {
            let mut expected_tag = hmac_sha256(&key.mac_key, &canon[..mac_region_end])[..10].to_vec();
            let last_idx = expected_tag.len() - 1;
            expected_tag[last_idx] &= 0xf0;
            if !constant_time_eq(&received_tag, &expected_tag) {
                continue;
            }

            let iv = sha256_16(&canon[0..11]);
            let cipher_region_end = encrypted.len() - 10;
            let plain = aes_cbc_decrypt(&encrypted[11..cipher_region_end], &key.aes_key, &iv);
            if padlen > plain.len() {
                continue;
            }
            let data = if padlen == 0 { &plain[..] } else { &plain[..plain.len() - padlen] };

            let mut orig = Vec::with_capacity(7 + data.len());
            orig.extend_from_slice(&encrypted[..7]);
            orig.extend_from_slice(data);
            return Ok((name.clone(), orig));
        }

        Err(KeychainError::NoMatchingKey)
    }
}

/// Load a single raw secret file. Exposed for the `!addkey` command, which
/// hands the command controller an in-memory secret rather than a path.
pub fn key_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_keychain() -> Keychain {
        let dir = std::env::temp_dir().join(format!("freakmesh-kc-{}", rand::random::<u64>()));
        Keychain::open(dir).unwrap()
    }

    /// Property 2/S5 from spec.md §8: encrypt/decrypt round-trip.
    #[test]
    fn encrypt_decrypt_round_trip() {
        let mut kc = temp_keychain();
        kc.add_key("grp", b"secret").unwrap();

        let plaintext: Vec<u8> = {
            let mut v = vec![0x00u8, 0x02, 0x78, 0x56, 0x34, 0x12, 0x0F];
            v.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
            v.push(5);
            v.extend_from_slice(b"alice");
            v.extend_from_slice(b"hi");
            v
        };

        let encrypted = kc.encrypt(&plaintext, "grp").unwrap();
        assert_eq!(encrypted[1] & flags::RELAYED, 0);
        let (name, decrypted) = kc.decrypt(&encrypted).unwrap();
        assert_eq!(name, "grp");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn encryption_is_non_deterministic() {
        let mut kc = temp_keychain();
        kc.add_key("grp", b"secret").unwrap();
        let plaintext = vec![0u8, 0, 1, 2, 3, 4, 15, 9, 9, 9, 9, 9, 9, 1, b'x'];
        let a = kc.encrypt(&plaintext, "grp").unwrap();
        let b = kc.encrypt(&plaintext, "grp").unwrap();
        assert_ne!(a, b);
    }

    /// Property 3: a single-bit flip outside the mutable header fields
    /// must cause rejection by every key.
    #[test]
    fn bit_flip_is_rejected() {
        let mut kc = temp_keychain();
        kc.add_key("grp", b"secret").unwrap();
        let plaintext = vec![0u8, 0, 1, 2, 3, 4, 15, 9, 9, 9, 9, 9, 9, 1, b'x'];
        let mut encrypted = kc.encrypt(&plaintext, "grp").unwrap();
        let flip_idx = encrypted.len() - 3; // inside the ciphertext/mac region
        encrypted[flip_idx] ^= 1;
        assert!(kc.decrypt(&encrypted).is_err());
    }

    /// Property 4: toggling Relayed and decrementing ttl must not
    /// invalidate the MAC.
    #[test]
    fn mutable_header_tolerance() {
        let mut kc = temp_keychain();
        kc.add_key("grp", b"secret").unwrap();
        let mut plaintext = vec![0u8, 0x02, 1, 2, 3, 4, 15, 9, 9, 9, 9, 9, 9, 1, b'x'];
        let mut encrypted = kc.encrypt(&plaintext, "grp").unwrap();

        encrypted[1] |= flags::RELAYED;
        encrypted[6] -= 1;

        let (_, decrypted) = kc.decrypt(&encrypted).unwrap();
        plaintext[1] |= flags::RELAYED;
        plaintext[6] -= 1;
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn unknown_key_is_reported() {
        let kc = temp_keychain();
        let plaintext = vec![0u8; 14];
        assert!(matches!(kc.encrypt(&plaintext, "nope"), Err(KeychainError::NoSuchKey(_))));
    }

    #[test]
    fn no_matching_key_on_decrypt() {
        let mut kc = temp_keychain();
        kc.add_key("grp", b"secret").unwrap();
        let mut other = temp_keychain();
        other.add_key("other", b"different").unwrap();
        let plaintext = vec![0u8, 0, 1, 2, 3, 4, 15, 9, 9, 9, 9, 9, 9, 1, b'x'];
        let encrypted = kc.encrypt(&plaintext, "grp").unwrap();
        assert_eq!(other.decrypt(&encrypted), Err(KeychainError::NoMatchingKey));
    }
}
