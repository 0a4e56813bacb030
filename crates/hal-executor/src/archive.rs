//! tar.gz packing and unpacking of job workspaces.
//!
//! Blocking tar work runs on the blocking thread pool.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use hal_config::job::CONFIG_FILE;
use hal_core::paths::resolve_within;
use hal_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use tokio::task::spawn_blocking;
use tracing::debug;

/// Size and checksum of a written archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub size: u64,
    pub sha256: String,
}

impl ArchiveSummary {
    /// Size in megabytes, as shown in job events.
    pub fn size_mb(&self) -> String {
        format_megabytes(self.size)
    }
}

pub fn format_megabytes(bytes: u64) -> String {
    let mb = bytes as f64 / 1_048_576.0;
    format!("{} MB", (mb * 100.0).round() / 100.0)
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveManager {
    /// Store symlink targets instead of the links themselves.
    dereference: bool,
}

impl ArchiveManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packer for cloud targets, which cannot carry symlinks.
    pub fn dereferencing() -> Self {
        Self { dereference: true }
    }

    /// Archive `source_dir/sub_path` into `target`.
    ///
    /// `sub_path` may not contain parent segments. The repository's
    /// `.hal9000.yml` is copied into the archived directory when it has none.
    pub async fn pack(&self, source_dir: &Path, sub_path: &str, target: &Path) -> Result<ArchiveSummary> {
        let dist = resolve_within(source_dir, sub_path)?;
        if !dist.is_dir() {
            return Err(Error::NotFound(format!(
                "distribution directory \"{sub_path}\""
            )));
        }

        let source_config = source_dir.join(CONFIG_FILE);
        let dist_config = dist.join(CONFIG_FILE);
        if source_config.is_file() && !dist_config.exists() {
            tokio::fs::copy(&source_config, &dist_config).await?;
        }

        let target = target.to_owned();
        let dereference = self.dereference;
        spawn_blocking(move || pack_sync(&dist, &target, dereference))
            .await
            .map_err(|e| Error::Internal(format!("archive task failed: {e}")))?
    }

    /// Extract `archive` into `target_dir`.
    ///
    /// With `strip_top_level`, the first path component of every member is
    /// dropped (GitHub tarballs wrap everything in one directory).
    pub async fn unpack(&self, archive: &Path, target_dir: &Path, strip_top_level: bool) -> Result<()> {
        let archive = archive.to_owned();
        let target_dir = target_dir.to_owned();
        spawn_blocking(move || unpack_sync(&archive, &target_dir, strip_top_level))
            .await
            .map_err(|e| Error::Internal(format!("archive task failed: {e}")))?
    }
}

fn pack_sync(dist: &Path, target: &Path, dereference: bool) -> Result<ArchiveSummary> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let encoder = GzEncoder::new(File::create(target)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(dereference);
    builder.append_dir_all(".", dist)?;
    builder.into_inner()?.finish()?;

    let size = std::fs::metadata(target)?.len();
    let mut hasher = Sha256::new();
    std::io::copy(&mut File::open(target)?, &mut hasher)?;
    let sha256 = hex::encode(hasher.finalize());

    debug!(target = %target.display(), size, "Created archive");
    Ok(ArchiveSummary { size, sha256 })
}

fn member_path(raw: &Path, strip_top_level: bool) -> Result<Option<PathBuf>> {
    let mut relative = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Traversal {
                    path: raw.display().to_string(),
                });
            }
        }
    }

    if strip_top_level {
        let mut components = relative.components();
        components.next();
        relative = components.as_path().to_path_buf();
    }

    Ok((!relative.as_os_str().is_empty()).then_some(relative))
}

/// Refuse members that would be written through a symlink created by an
/// earlier member. A symlink at the destination itself is replaced.
fn check_parents(target_dir: &Path, relative: &Path) -> Result<()> {
    let mut current = target_dir.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        current.push(component);
        let Ok(meta) = std::fs::symlink_metadata(&current) else {
            break;
        };
        if !meta.file_type().is_symlink() {
            continue;
        }
        if components.peek().is_some() {
            return Err(Error::Traversal {
                path: relative.display().to_string(),
            });
        }
        std::fs::remove_file(&current)?;
    }
    Ok(())
}

fn unpack_sync(archive: &Path, target_dir: &Path, strip_top_level: bool) -> Result<()> {
    std::fs::create_dir_all(target_dir)?;

    let mut tarball = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    tarball.set_preserve_permissions(true);
    tarball.set_preserve_mtime(true);

    let mut count = 0usize;
    for entry in tarball.entries()? {
        let mut entry = entry?;
        if matches!(
            entry.header().entry_type(),
            EntryType::XGlobalHeader | EntryType::XHeader
        ) {
            continue;
        }

        let raw = entry.path()?.into_owned();
        let Some(relative) = member_path(&raw, strip_top_level)? else {
            continue;
        };

        check_parents(target_dir, &relative)?;
        let dest = target_dir.join(&relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if entry.header().entry_type() == EntryType::Link {
            let link = entry
                .link_name()?
                .ok_or_else(|| Error::Traversal {
                    path: raw.display().to_string(),
                })?
                .into_owned();
            let Some(source) = member_path(&link, strip_top_level)? else {
                continue;
            };
            check_parents(target_dir, &source)?;
            std::fs::hard_link(target_dir.join(source), &dest)?;
        } else {
            entry.unpack(&dest)?;
        }
        count += 1;
    }

    debug!(archive = %archive.display(), entries = count, "Extracted archive");
    Ok(())
}
