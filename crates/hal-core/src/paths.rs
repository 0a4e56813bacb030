//! Lexical path checks.
//!
//! Nothing here touches the filesystem: checks run before any archive or
//! extract operation, when the paths may not exist yet.

use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// True when any segment of `path` is `..`, for either separator style.
pub fn has_traversal(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

/// Collapse `.` and `..` segments without resolving symlinks.
///
/// `..` never climbs above the root of an absolute path.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when `path` lies inside `base` (or is `base`) after normalization.
pub fn is_within(base: &Path, path: &Path) -> bool {
    normalize(path).starts_with(normalize(base))
}

/// Join a relative `sub_path` onto `base`, refusing any parent segment.
///
/// Leading and trailing separators on `sub_path` are ignored, so `/dist/`
/// and `dist` are equivalent. An empty path or `.` resolves to `base`.
pub fn resolve_within(base: &Path, sub_path: &str) -> Result<PathBuf> {
    if has_traversal(sub_path) {
        return Err(Error::Traversal {
            path: sub_path.to_string(),
        });
    }

    let trimmed = sub_path.trim_matches(['/', '\\']);
    if trimmed.is_empty() || trimmed == "." {
        return Ok(base.to_path_buf());
    }

    let joined = normalize(&base.join(trimmed));
    if !is_within(base, &joined) {
        return Err(Error::Traversal {
            path: sub_path.to_string(),
        });
    }
    Ok(joined)
}
