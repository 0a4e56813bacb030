//! SSH credential lookup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Matches any server.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    /// Exact hostname, or `*` for any server.
    pub server: String,
    /// Private key used for this user.
    pub identity: PathBuf,
}

impl Credential {
    pub fn new(username: impl Into<String>, server: impl Into<String>, identity: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            server: server.into(),
            identity: identity.into(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.server == WILDCARD
    }
}

/// Registered credentials, kept in registration order.
#[derive(Debug, Clone, Default)]
pub struct CredentialWallet {
    credentials: Vec<Credential>,
}

impl CredentialWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, credential: Credential) {
        self.credentials.push(credential);
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Exact server match wins; otherwise the first wildcard registered for
    /// the user.
    pub fn find(&self, username: &str, server: &str) -> Option<&Credential> {
        let mut wildcard = None;
        for credential in self.credentials.iter().filter(|c| c.username == username) {
            if credential.server == server {
                return Some(credential);
            }
            if wildcard.is_none() && credential.is_wildcard() {
                wildcard = Some(credential);
            }
        }
        wildcard
    }
}

impl FromIterator<Credential> for CredentialWallet {
    fn from_iter<I: IntoIterator<Item = Credential>>(iter: I) -> Self {
        Self {
            credentials: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet() -> CredentialWallet {
        [
            Credential::new("u1", "*", "/keys/u1-any"),
            Credential::new("u1", "h1", "/keys/u1-h1"),
            Credential::new("u2", "h1", "/keys/u2-h1"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_exact_server_preferred_over_wildcard() {
        let wallet = wallet();
        let found = wallet.find("u1", "h1").unwrap();
        assert_eq!(found.identity, PathBuf::from("/keys/u1-h1"));
    }

    #[test]
    fn test_falls_back_to_wildcard() {
        let wallet = wallet();
        let found = wallet.find("u1", "h2").unwrap();
        assert_eq!(found.server, "*");
    }

    #[test]
    fn test_unknown_user() {
        assert!(wallet().find("u3", "h1").is_none());
    }

    #[test]
    fn test_no_wildcard_no_match() {
        let wallet = wallet();
        assert!(wallet.find("u2", "h2").is_none());
    }

    #[test]
    fn test_first_wildcard_wins() {
        let mut wallet = CredentialWallet::new();
        wallet.add(Credential::new("u1", "*", "/keys/first"));
        wallet.add(Credential::new("u1", "*", "/keys/second"));
        assert_eq!(wallet.find("u1", "any").unwrap().identity, PathBuf::from("/keys/first"));
    }
}
