//! # Change Detection
//!
//! Content fingerprints for ConfigMaps and Secrets.
//!
//! A fingerprint is a SHA-256 digest over the data payload only. Metadata
//! (labels, annotations, resourceVersion, managedFields) never contributes, so
//! an unrelated writer bumping a label produces an identical fingerprint.
//!
//! Framing: every entry is written as `section || len(key) || key || len(value) || value`
//! with big-endian `u64` lengths, iterating keys in sorted order. The section tag
//! keeps `data["a"]` and `binaryData["a"]` apart and the length prefixes keep
//! `{"ab": "c"}` apart from `{"a": "bc"}`.

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroizing;

/// Hex-encoded SHA-256 content digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Section of a resource payload an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Section {
    Text = 1,
    Binary = 2,
}

/// Data payload of a ConfigMap or Secret, normalised for hashing
///
/// Values are held in zeroizing buffers since Secret payloads pass through here.
#[derive(Default)]
pub struct ResourceContent {
    entries: BTreeMap<(Section, String), Zeroizing<Vec<u8>>>,
}

impl fmt::Debug for ResourceContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceContent")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl ResourceContent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a textual entry (`data` of a ConfigMap, `data`/`stringData` of a Secret)
    pub fn insert_text(&mut self, key: &str, value: &[u8]) {
        self.entries
            .insert((Section::Text, key.to_string()), Zeroizing::new(value.to_vec()));
    }

    /// Add a binary entry (`binaryData` of a ConfigMap)
    pub fn insert_binary(&mut self, key: &str, value: &[u8]) {
        self.entries
            .insert((Section::Binary, key.to_string()), Zeroizing::new(value.to_vec()));
    }

    /// Digest the payload
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for ((section, key), value) in &self.entries {
            hasher.update([*section as u8]);
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_slice());
        }
        Fingerprint(format!("{:x}", hasher.finalize()))
    }
}

/// Fingerprint a ConfigMap's `data` and `binaryData`
#[must_use]
pub fn fingerprint_config_map(config_map: &ConfigMap) -> Fingerprint {
    let mut content = ResourceContent::new();
    if let Some(data) = &config_map.data {
        for (key, value) in data {
            content.insert_text(key, value.as_bytes());
        }
    }
    if let Some(binary) = &config_map.binary_data {
        for (key, value) in binary {
            content.insert_binary(key, &value.0);
        }
    }
    content.fingerprint()
}

/// Fingerprint a Secret's `data` and `stringData`
///
/// The API server folds `stringData` into `data` on write, so a key present in
/// both is hashed once with the `stringData` value, matching what the server
/// will persist.
#[must_use]
pub fn fingerprint_secret(secret: &Secret) -> Fingerprint {
    let mut content = ResourceContent::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            content.insert_text(key, &value.0);
        }
    }
    if let Some(string_data) = &secret.string_data {
        for (key, value) in string_data {
            content.insert_text(key, value.as_bytes());
        }
    }
    content.fingerprint()
}
