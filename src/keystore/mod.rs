//! Envelope encryption of collection keys (DEKs) under registered RSA key pairs (KEKs).
//!
//! Each DEK is wrapped independently for every recipient KEK with RSA-OAEP/SHA-256.
//! Revoking access is removing a private key: a DEK no loaded KEK can unwrap is gone.

use lru::LruCache;
use openssl::encrypt::{Decrypter, Encrypter};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::{Padding, Rsa};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::KeyStoreConfig;

pub const DEK_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("DEK id must not be empty")]
    EmptyDekId,

    #[error("no KEK recipients given for DEK {0}")]
    NoRecipients(String),

    #[error("KEK {0} is not registered")]
    UnknownKek(String),

    #[error("no locally available private key can decrypt DEK {dek_id} (slots: {slots:?})")]
    NoMatchingPrivateKey { dek_id: String, slots: Vec<String> },

    #[error("openssl error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

/// One recipient's copy of a wrapped DEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySlot {
    pub kek_fingerprint: String,
    #[serde(with = "hex_bytes")]
    pub dek_encrypted: Vec<u8>,
}

/// A DEK wrapped for every authorized KEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    pub key_id: String,
    pub slots: Vec<KeySlot>,
}

struct Kek {
    public: PKey<Public>,
    private: Option<PKey<Private>>,
}

pub struct KeyStore {
    keks: RwLock<HashMap<String, Kek>>,
    dek_cache: Mutex<LruCache<String, Zeroizing<Vec<u8>>>>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new(&KeyStoreConfig::default())
    }
}

impl KeyStore {
    pub fn new(config: &KeyStoreConfig) -> Self {
        let capacity = NonZeroUsize::new(config.dek_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            keks: RwLock::new(HashMap::new()),
            dek_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Hex SHA-256 of the DER-encoded public key.
    pub fn fingerprint(public_der: &[u8]) -> String {
        hex::encode(Sha256::digest(public_der))
    }

    /// Registers a full key pair; returns its fingerprint.
    pub fn register_private_key(&self, private: PKey<Private>) -> Result<String, KeyStoreError> {
        let der = private.public_key_to_der()?;
        let public = PKey::public_key_from_der(&der)?;
        let fingerprint = Self::fingerprint(&der);
        self.keks.write().insert(
            fingerprint.clone(),
            Kek {
                public,
                private: Some(private),
            },
        );
        debug!(kek = %fingerprint, "registered KEK with private key");
        Ok(fingerprint)
    }

    /// Registers an encrypt-only recipient; returns its fingerprint.
    pub fn register_public_key(&self, public: PKey<Public>) -> Result<String, KeyStoreError> {
        let fingerprint = Self::fingerprint(&public.public_key_to_der()?);
        let mut keks = self.keks.write();
        // never downgrade an entry that already holds the private half
        keks.entry(fingerprint.clone()).or_insert(Kek {
            public,
            private: None,
        });
        debug!(kek = %fingerprint, "registered public-only KEK");
        Ok(fingerprint)
    }

    pub fn register_private_key_pem(&self, pem: &[u8]) -> Result<String, KeyStoreError> {
        self.register_private_key(PKey::private_key_from_pem(pem)?)
    }

    pub fn register_public_key_pem(&self, pem: &[u8]) -> Result<String, KeyStoreError> {
        self.register_public_key(PKey::public_key_from_pem(pem)?)
    }

    pub fn fingerprints(&self) -> Vec<String> {
        let mut out: Vec<String> = self.keks.read().keys().cloned().collect();
        out.sort();
        out
    }

    pub fn generate_kek(bits: u32) -> Result<PKey<Private>, KeyStoreError> {
        Ok(PKey::from_rsa(Rsa::generate(bits)?)?)
    }

    pub fn generate_dek() -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
        let mut dek = Zeroizing::new(vec![0u8; DEK_LEN]);
        openssl::rand::rand_bytes(&mut dek)?;
        Ok(dek)
    }

    pub fn encrypt_dek(
        &self,
        dek_id: &str,
        raw_key: &[u8],
        kek_fingerprints: &[String],
    ) -> Result<KeyEnvelope, KeyStoreError> {
        if dek_id.is_empty() {
            return Err(KeyStoreError::EmptyDekId);
        }
        if kek_fingerprints.is_empty() {
            return Err(KeyStoreError::NoRecipients(dek_id.to_string()));
        }

        let keks = self.keks.read();
        let mut slots = Vec::with_capacity(kek_fingerprints.len());
        for fingerprint in kek_fingerprints {
            let kek = keks
                .get(fingerprint)
                .ok_or_else(|| KeyStoreError::UnknownKek(fingerprint.clone()))?;
            slots.push(KeySlot {
                kek_fingerprint: fingerprint.clone(),
                dek_encrypted: oaep_encrypt(&kek.public, raw_key)?,
            });
        }

        Ok(KeyEnvelope {
            key_id: dek_id.to_string(),
            slots,
        })
    }

    /// Unwraps with the first slot a local private key can open. Results are cached
    /// by DEK id.
    pub fn decrypt_dek(&self, envelope: &KeyEnvelope) -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
        if let Some(cached) = self.dek_cache.lock().get(&envelope.key_id) {
            return Ok(cached.clone());
        }

        let dek = {
            let keks = self.keks.read();
            envelope.slots.iter().find_map(|slot| {
                let private = keks.get(&slot.kek_fingerprint)?.private.as_ref()?;
                match oaep_decrypt(private, &slot.dek_encrypted) {
                    Ok(dek) => Some(dek),
                    Err(e) => {
                        debug!(dek = %envelope.key_id, kek = %slot.kek_fingerprint, "slot did not decrypt: {e}");
                        None
                    }
                }
            })
        };

        let dek = dek.ok_or_else(|| KeyStoreError::NoMatchingPrivateKey {
            dek_id: envelope.key_id.clone(),
            slots: envelope
                .slots
                .iter()
                .map(|s| s.kek_fingerprint.clone())
                .collect(),
        })?;

        self.dek_cache
            .lock()
            .put(envelope.key_id.clone(), dek.clone());
        Ok(dek)
    }

    /// Drops a private key. Cached DEKs are flushed so revocation takes effect at once.
    pub fn forget_private_key(&self, fingerprint: &str) {
        if let Some(kek) = self.keks.write().get_mut(fingerprint) {
            kek.private = None;
        }
        self.dek_cache.lock().clear();
    }
}

fn oaep_encrypt(public: &PKey<Public>, data: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
    let mut encrypter = Encrypter::new(public)?;
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    encrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
    encrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;
    let mut out = vec![0u8; encrypter.encrypt_len(data)?];
    let n = encrypter.encrypt(data, &mut out)?;
    out.truncate(n);
    Ok(out)
}

fn oaep_decrypt(private: &PKey<Private>, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
    let mut decrypter = Decrypter::new(private)?;
    decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    decrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
    decrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;
    let mut out = Zeroizing::new(vec![0u8; decrypter.decrypt_len(data)?]);
    let n = decrypter.decrypt(data, &mut out)?;
    out.truncate(n);
    Ok(out)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
