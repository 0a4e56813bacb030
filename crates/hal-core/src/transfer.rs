//! File transfer abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::paths::has_traversal;
use crate::{Error, Result};

/// The remote side of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteLocation {
    Ssh {
        user: String,
        host: String,
        path: String,
    },
    S3 {
        bucket: String,
        key: String,
    },
}

impl RemoteLocation {
    pub fn path(&self) -> &str {
        match self {
            RemoteLocation::Ssh { path, .. } => path,
            RemoteLocation::S3 { key, .. } => key,
        }
    }

    /// `user@host:path` or `s3://bucket/key`.
    pub fn uri(&self) -> String {
        match self {
            RemoteLocation::Ssh { user, host, path } => format!("{user}@{host}:{path}"),
            RemoteLocation::S3 { bucket, key } => {
                format!("s3://{}/{}", bucket, key.trim_start_matches('/'))
            }
        }
    }
}

impl std::fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Moves files between the local workspace and a remote location.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Copy `local` (a directory or archive) to `remote`, skipping `excludes`.
    async fn push(&self, local: &Path, remote: &RemoteLocation, excludes: &[String]) -> Result<()>;

    /// Copy `remote` into `local`.
    async fn pull(&self, remote: &RemoteLocation, local: &Path) -> Result<()>;
}

/// Refuse both sides of a transfer when either contains a `..` segment.
pub fn check_transfer_paths(local: &Path, remote: &RemoteLocation) -> Result<()> {
    let local = local.to_string_lossy();
    for path in [local.as_ref(), remote.path()] {
        if has_traversal(path) {
            return Err(Error::Traversal {
                path: path.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri() {
        let ssh = RemoteLocation::Ssh {
            user: "sshuser".to_string(),
            host: "127.0.0.1".to_string(),
            path: "/herp/derp".to_string(),
        };
        assert_eq!(ssh.uri(), "sshuser@127.0.0.1:/herp/derp");

        let s3 = RemoteLocation::S3 {
            bucket: "artifacts".to_string(),
            key: "/builds/hal9000-1.tar.gz".to_string(),
        };
        assert_eq!(s3.uri(), "s3://artifacts/builds/hal9000-1.tar.gz");
    }

    #[test]
    fn test_check_transfer_paths() {
        let remote = RemoteLocation::Ssh {
            user: "u".to_string(),
            host: "h".to_string(),
            path: "/var/www/../etc".to_string(),
        };
        assert!(check_transfer_paths(Path::new("/tmp/hal/job"), &remote).is_err());
        let remote = RemoteLocation::S3 {
            bucket: "b".to_string(),
            key: "site".to_string(),
        };
        assert!(check_transfer_paths(Path::new("/tmp/hal/job"), &remote).is_ok());
        assert!(check_transfer_paths(Path::new("/tmp/hal/../job"), &remote).is_err());
    }
}
