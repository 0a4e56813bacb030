//! Job identifiers.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Identifier of a build or push, as assigned by the job store.
///
/// Ids are opaque strings; the agent never generates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::str::FromStr for JobId {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput("job id cannot be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}
