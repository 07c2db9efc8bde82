/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! AEAD sessions, key pairs and key files.
//!
//! Every datagram is AES-256-GCM sealed. The nonce is the sender's 8-byte
//! monotonic counter (zero-padded to the 12-byte GCM nonce) and travels in
//! clear ahead of the ciphertext; a 64-entry sliding window rejects replays.
//! Each direction uses its own key, so counters never collide.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Result, StagecastError};
use crate::formats::{Parser, Serializer};
use crate::statistics::CryptoStatistics;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 8;
pub const TAG_LEN: usize = 16;
/// Bytes the AEAD framing adds to a plaintext.
pub const CRYPTO_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Associated data marking a key request.
pub const KEYREQ_ID: u8 = 0x01;
/// Associated data marking a key response.
pub const KEYREQ_SERVER_ID: u8 = 0x02;

mod b64_key {
    use super::{BASE64, KEY_LEN};
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        key: &[u8; KEY_LEN],
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<[u8; KEY_LEN], D::Error> {
        let text = String::deserialize(d)?;
        let raw = BASE64.decode(text.as_bytes()).map_err(D::Error::custom)?;
        raw.try_into()
            .map_err(|_| D::Error::custom("key must be 32 bytes"))
    }
}

/// Directional key material for one client: the server encrypts with
/// `downlink` and decrypts with `uplink`.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyPair {
    #[serde(with = "b64_key")]
    pub downlink: [u8; KEY_LEN],
    #[serde(with = "b64_key")]
    pub uplink: [u8; KEY_LEN],
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut downlink = [0u8; KEY_LEN];
        let mut uplink = [0u8; KEY_LEN];
        rng.fill_bytes(&mut downlink);
        rng.fill_bytes(&mut uplink);
        Self { downlink, uplink }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log key material
        write!(f, "KeyPair {{ .. }}")
    }
}

/// 64-entry sliding bitmap over receive counters.
#[derive(Default)]
struct ReplayWindow {
    highest: Option<u64>,
    mask: u64,
}

impl ReplayWindow {
    fn check(&self, counter: u64) -> bool {
        match self.highest {
            None => true,
            Some(highest) => {
                if counter > highest {
                    true
                } else {
                    let age = highest - counter;
                    age < 64 && self.mask & (1 << age) == 0
                }
            }
        }
    }

    fn update(&mut self, counter: u64) {
        match self.highest {
            None => {
                self.highest = Some(counter);
                self.mask = 1;
            }
            Some(highest) if counter > highest => {
                let shift = counter - highest;
                self.mask = if shift >= 64 { 1 } else { (self.mask << shift) | 1 };
                self.highest = Some(counter);
            }
            Some(highest) => {
                self.mask |= 1 << (highest - counter);
            }
        }
    }
}

/// One direction pair of AEAD state: encrypt counter, decrypt replay window.
pub struct CryptoSession {
    tx: Aes256Gcm,
    rx: Aes256Gcm,
    next_nonce: u64,
    replay: ReplayWindow,
    stats: CryptoStatistics,
}

fn make_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

impl CryptoSession {
    pub fn new(tx_key: &[u8; KEY_LEN], rx_key: &[u8; KEY_LEN]) -> Self {
        Self {
            tx: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(tx_key)),
            rx: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(rx_key)),
            next_nonce: 0,
            replay: ReplayWindow::default(),
            stats: CryptoStatistics::default(),
        }
    }

    /// Server end: sends on the downlink key, listens on the uplink key.
    pub fn server(key_pair: &KeyPair) -> Self {
        Self::new(&key_pair.downlink, &key_pair.uplink)
    }

    /// Client end of the same pair.
    pub fn client(key_pair: &KeyPair) -> Self {
        Self::new(&key_pair.uplink, &key_pair.downlink)
    }

    pub fn encrypt(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let counter = self.next_nonce;
        self.next_nonce += 1;
        let nonce = make_nonce(counter);
        let sealed = self
            .tx
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| StagecastError::Decryption)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&counter.to_le_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&mut self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < CRYPTO_OVERHEAD {
            self.stats.decrypt_failures += 1;
            return Err(StagecastError::Decryption);
        }
        let mut counter_bytes = [0u8; NONCE_LEN];
        counter_bytes.copy_from_slice(&ciphertext[..NONCE_LEN]);
        let counter = u64::from_le_bytes(counter_bytes);
        if !self.replay.check(counter) {
            self.stats.replays += 1;
            return Err(StagecastError::Decryption);
        }
        let nonce = make_nonce(counter);
        match self.rx.decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext[NONCE_LEN..],
                aad,
            },
        ) {
            Ok(plaintext) => {
                self.replay.update(counter);
                Ok(plaintext)
            }
            Err(_) => {
                self.stats.decrypt_failures += 1;
                Err(StagecastError::Decryption)
            }
        }
    }

    pub fn statistics(&self) -> &CryptoStatistics {
        &self.stats
    }
}

/// The rekey offer sent in response to a key request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyMessage {
    pub id: u8,
    pub key_pair: KeyPair,
}

impl KeyMessage {
    pub const SERIALIZED_LEN: usize = 1 + 2 * KEY_LEN;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut s = Serializer::new();
        s.u8(self.id);
        s.bytes(&self.key_pair.downlink);
        s.bytes(&self.key_pair.uplink);
        s.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut p = Parser::new(bytes);
        let id = p.u8()?;
        let mut downlink = [0u8; KEY_LEN];
        let mut uplink = [0u8; KEY_LEN];
        p.bytes(&mut downlink)?;
        p.bytes(&mut uplink)?;
        if p.remaining() != 0 {
            return Err(StagecastError::InvalidPacket("trailing bytes"));
        }
        Ok(Self {
            id,
            key_pair: KeyPair { downlink, uplink },
        })
    }
}

/// A client identity loaded from a key file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LongLivedKey {
    pub name: String,
    pub id: u8,
    pub key_pair: KeyPair,
}

impl LongLivedKey {
    pub fn generate(name: &str, id: u8) -> Self {
        Self {
            name: name.to_string(),
            id,
            key_pair: KeyPair::generate(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let keyfile_err = |reason: String| StagecastError::KeyFile {
            path: path.display().to_string(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| keyfile_err(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| keyfile_err(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let keyfile_err = |reason: String| StagecastError::KeyFile {
            path: path.display().to_string(),
            reason,
        };
        let text = serde_json::to_string_pretty(self).map_err(|e| keyfile_err(e.to_string()))?;
        fs::write(path, text + "\n").map_err(|e| keyfile_err(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StagecastError::KeyFile {
            path: "<memory>".to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (CryptoSession, CryptoSession) {
        let keys = KeyPair::generate();
        (CryptoSession::server(&keys), CryptoSession::client(&keys))
    }

    #[test]
    fn round_trip_both_directions() {
        let (mut server, mut client) = session_pair();

        let downstream = server.encrypt(&[], b"to the client").unwrap();
        assert_eq!(client.decrypt(&[], &downstream).unwrap(), b"to the client");

        let upstream = client.encrypt(&[7], b"to the server").unwrap();
        assert_eq!(server.decrypt(&[7], &upstream).unwrap(), b"to the server");
    }

    #[test]
    fn aad_mismatch_rejected() {
        let (mut server, mut client) = session_pair();
        let sealed = server.encrypt(&[KEYREQ_ID], b"hello").unwrap();
        assert!(client.decrypt(&[KEYREQ_SERVER_ID], &sealed).is_err());
        assert_eq!(client.statistics().decrypt_failures, 1);
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (mut server, mut client) = session_pair();
        let mut sealed = server.encrypt(&[], b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(client.decrypt(&[], &sealed).is_err());
    }

    #[test]
    fn replayed_datagram_rejected() {
        let (mut server, mut client) = session_pair();
        let sealed = server.encrypt(&[], b"once").unwrap();
        assert!(client.decrypt(&[], &sealed).is_ok());
        assert!(client.decrypt(&[], &sealed).is_err());
        assert_eq!(client.statistics().replays, 1);
    }

    #[test]
    fn reordered_datagrams_within_window_accepted() {
        let (mut server, mut client) = session_pair();
        let first = server.encrypt(&[], b"first").unwrap();
        let second = server.encrypt(&[], b"second").unwrap();
        assert_eq!(client.decrypt(&[], &second).unwrap(), b"second");
        assert_eq!(client.decrypt(&[], &first).unwrap(), b"first");
        assert!(client.decrypt(&[], &first).is_err());
    }

    #[test]
    fn wrong_key_rejected() {
        let (mut server, _) = session_pair();
        let (_, mut stranger) = session_pair();
        let sealed = server.encrypt(&[], b"secret").unwrap();
        assert!(stranger.decrypt(&[], &sealed).is_err());
    }

    #[test]
    fn key_message_round_trip() {
        let msg = KeyMessage {
            id: 9,
            key_pair: KeyPair::generate(),
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), KeyMessage::SERIALIZED_LEN);
        assert_eq!(KeyMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn key_file_round_trip() {
        let key = LongLivedKey::generate("alice", 3);
        let path = std::env::temp_dir().join(format!("stagecast-keyfile-{}", std::process::id()));
        key.save(&path).unwrap();
        let loaded = LongLivedKey::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.name, "alice");
        assert_eq!(loaded.id, 3);
        assert_eq!(loaded.key_pair, key.key_pair);
    }

    #[test]
    fn key_file_rejects_garbage() {
        let path = std::env::temp_dir().join(format!("stagecast-badkey-{}", std::process::id()));
        std::fs::write(&path, "not json").unwrap();
        let result = LongLivedKey::load(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(StagecastError::KeyFile { .. })));
    }
}
