//! Job store: where build and push records come from.
//!
//! Records are owned elsewhere; the agent reads snapshots and writes back
//! nothing but status changes.

use async_trait::async_trait;
use chrono::Utc;
use hal_core::job::{Build, JobStatus, Push};
use hal_core::{Error, JobId, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn build(&self, id: &JobId) -> Result<Option<Build>>;

    async fn push(&self, id: &JobId) -> Result<Option<Push>>;

    async fn pushes(&self) -> Result<Vec<Push>>;

    async fn set_build_status(&self, id: &JobId, status: JobStatus) -> Result<()>;

    async fn set_push_status(&self, id: &JobId, status: JobStatus) -> Result<()>;

    /// Waiting pushes, oldest first.
    async fn waiting_pushes(&self) -> Result<Vec<Push>> {
        let mut pushes: Vec<Push> = self
            .pushes()
            .await?
            .into_iter()
            .filter(|p| p.status == JobStatus::Waiting)
            .collect();
        pushes.sort_by_key(|p| p.created);
        Ok(pushes)
    }

    /// Pushes to `target` currently in `status`.
    async fn pushes_to(&self, target: &str, status: JobStatus) -> Result<Vec<Push>> {
        Ok(self
            .pushes()
            .await?
            .into_iter()
            .filter(|p| p.status == status && p.target.as_ref().is_some_and(|t| t.id == target))
            .collect())
    }
}

/// One JSON document per record: `builds/<id>.json` and `pushes/<id>.json`.
pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, kind: &str, id: &JobId) -> Result<PathBuf> {
        let id = id.to_string();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(Error::InvalidInput(format!("invalid job id \"{id}\"")));
        }
        Ok(self.root.join(kind).join(format!("{id}.json")))
    }

    async fn read<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temporary file so readers never see half a record.
    async fn write<T: serde::Serialize>(path: &Path, record: &T) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn build(&self, id: &JobId) -> Result<Option<Build>> {
        Self::read(&self.record_path("builds", id)?).await
    }

    async fn push(&self, id: &JobId) -> Result<Option<Push>> {
        Self::read(&self.record_path("pushes", id)?).await
    }

    async fn pushes(&self) -> Result<Vec<Push>> {
        let dir = self.root.join("pushes");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut pushes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read::<Push>(&path).await {
                Ok(Some(push)) => pushes.push(push),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable push record"),
            }
        }
        Ok(pushes)
    }

    async fn set_build_status(&self, id: &JobId, status: JobStatus) -> Result<()> {
        let path = self.record_path("builds", id)?;
        let mut build: Build = Self::read(&path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("build {id}")))?;
        stamp(&mut build.status, &mut build.start, &mut build.end, status);
        debug!(job_id = %id, %status, "Updating build status");
        Self::write(&path, &build).await
    }

    async fn set_push_status(&self, id: &JobId, status: JobStatus) -> Result<()> {
        let path = self.record_path("pushes", id)?;
        let mut push: Push = Self::read(&path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("push {id}")))?;
        stamp(&mut push.status, &mut push.start, &mut push.end, status);
        debug!(job_id = %id, %status, "Updating push status");
        Self::write(&path, &push).await
    }
}

/// Running states set the start time, terminal states the end time.
fn stamp(
    current: &mut JobStatus,
    start: &mut Option<chrono::DateTime<Utc>>,
    end: &mut Option<chrono::DateTime<Utc>>,
    status: JobStatus,
) {
    *current = status;
    match status {
        JobStatus::Building | JobStatus::Pushing => *start = Some(Utc::now()),
        JobStatus::Success | JobStatus::Error => *end = Some(Utc::now()),
        JobStatus::Waiting => {}
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryJobStore {
    builds: Mutex<BTreeMap<JobId, Build>>,
    pushes: Mutex<BTreeMap<JobId, Push>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_build(&self, build: Build) {
        if let Ok(mut builds) = self.builds.lock() {
            builds.insert(build.id.clone(), build);
        }
    }

    pub fn add_push(&self, push: Push) {
        if let Ok(mut pushes) = self.pushes.lock() {
            pushes.insert(push.id.clone(), push);
        }
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Internal("job store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn build(&self, id: &JobId) -> Result<Option<Build>> {
        Ok(self.builds.lock().map_err(poisoned)?.get(id).cloned())
    }

    async fn push(&self, id: &JobId) -> Result<Option<Push>> {
        Ok(self.pushes.lock().map_err(poisoned)?.get(id).cloned())
    }

    async fn pushes(&self) -> Result<Vec<Push>> {
        Ok(self.pushes.lock().map_err(poisoned)?.values().cloned().collect())
    }

    async fn set_build_status(&self, id: &JobId, status: JobStatus) -> Result<()> {
        let mut builds = self.builds.lock().map_err(poisoned)?;
        let build = builds
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("build {id}")))?;
        stamp(&mut build.status, &mut build.start, &mut build.end, status);
        Ok(())
    }

    async fn set_push_status(&self, id: &JobId, status: JobStatus) -> Result<()> {
        let mut pushes = self.pushes.lock().map_err(poisoned)?;
        let push = pushes
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("push {id}")))?;
        stamp(&mut push.status, &mut push.start, &mut push.end, status);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::TimeZone;
    use hal_core::job::{Repository, Target, TargetKind};

    use super::*;

    pub fn build(id: &str, status: JobStatus) -> Build {
        Build {
            id: JobId::from(id),
            status,
            repository: Repository {
                key: "repokey".to_string(),
                github_user: "user1".to_string(),
                github_repo: "repo1".to_string(),
                ..Default::default()
            },
            environment: "envname".to_string(),
            reference: "master".to_string(),
            commit: "5555".to_string(),
            user: None,
            platform: None,
            encrypted: BTreeMap::new(),
            created: Utc.with_ymd_and_hms(2015, 3, 15, 12, 0, 0).unwrap(),
            start: None,
            end: None,
        }
    }

    pub fn rsync_target(id: &str) -> Target {
        Target {
            id: id.to_string(),
            kind: TargetKind::Rsync {
                server: "127.0.0.1".to_string(),
                path: "/herp/derp".to_string(),
            },
        }
    }

    pub fn push(id: &str, status: JobStatus, target: Option<Target>) -> Push {
        Push {
            id: JobId::from(id),
            status,
            build: build("5678", JobStatus::Success),
            target,
            user: None,
            created: Utc.with_ymd_and_hms(2015, 3, 15, 12, 30, 0).unwrap(),
            start: None,
            end: None,
        }
    }
}
