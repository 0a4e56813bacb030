//! Encrypted property resolution.

use std::collections::{BTreeMap, HashMap};

/// Decrypts encrypted job properties.
///
/// Returns only the properties it could decrypt. Callers compare the count
/// against the request to detect failures.
pub trait PropertyDecrypter: Send + Sync {
    fn decrypt(&self, encrypted: &BTreeMap<String, String>) -> BTreeMap<String, String>;
}

/// Decrypter backed by secrets from the agent configuration.
///
/// Encrypted property values are secret names; unknown names are dropped.
#[derive(Debug, Clone, Default)]
pub struct StaticDecrypter {
    secrets: HashMap<String, String>,
}

impl StaticDecrypter {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }
}

impl PropertyDecrypter for StaticDecrypter {
    fn decrypt(&self, encrypted: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        encrypted
            .iter()
            .filter_map(|(name, reference)| {
                self.secrets
                    .get(reference)
                    .map(|plain| (name.clone(), plain.clone()))
            })
            .collect()
    }
}

/// Add decrypted properties to an environment as `ENCRYPTED_<NAME>`.
pub fn merge_into_env(
    env: &BTreeMap<String, String>,
    decrypted: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = env.clone();
    for (name, value) in decrypted {
        merged.insert(format!("ENCRYPTED_{}", name.to_uppercase()), value.clone());
    }
    merged
}
