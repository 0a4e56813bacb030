//! S3 push: either sync the checkout under a key prefix, or pack it into a
//! single archive (symlinks dereferenced) and upload that.

use hal_core::stage::Stage;
use hal_core::transfer::RemoteLocation;
use hal_core::{JobId, PropertyBag, Result};
use hal_executor::ArchiveManager;
use hal_executor::stages::PackStage;
use hal_executor::transfer::normalize_s3_prefix;
use serde::Deserialize;
use std::sync::Arc;

use super::{LocationFn, Payload, PushContext, UploadStage, build_id, prepare};

pub const UNPACK_FAILED: i32 = 400;
pub const PACK_FAILED: i32 = 401;
pub const UPLOAD_FAILED: i32 = 402;
pub const TRANSFORM_FAILED: i32 = 403;

#[derive(Debug, Deserialize)]
struct S3Target {
    bucket: String,
    #[serde(default)]
    path: String,
}

/// Where an archive upload lands: `path` when it names an object, otherwise
/// `<build>.tar.gz` under it.
fn archive_key(path: &str, build: &str) -> String {
    let path = normalize_s3_prefix(path);
    if path.is_empty() {
        format!("{build}.tar.gz")
    } else if path.ends_with('/') {
        format!("{path}{build}.tar.gz")
    } else {
        path.to_string()
    }
}

pub fn stages(ctx: &PushContext, archive: bool) -> Vec<Arc<dyn Stage>> {
    let mut stages = prepare(ctx, UNPACK_FAILED, TRANSFORM_FAILED);

    if archive {
        let location: LocationFn = Arc::new(|_job: &JobId, bag: &PropertyBag| -> Result<RemoteLocation> {
            let target: S3Target = bag.get_as("target")?;
            Ok(RemoteLocation::S3 {
                key: archive_key(&target.path, build_id(bag)?),
                bucket: target.bucket,
            })
        });
        stages.push(Arc::new(
            PackStage::new(ArchiveManager::dereferencing(), ctx.logger.clone(), PACK_FAILED)
                .with_event("Pack deployment into archive"),
        ));
        stages.push(Arc::new(UploadStage::new(ctx, UPLOAD_FAILED, Payload::Package, location)));
    } else {
        let location: LocationFn = Arc::new(|_job: &JobId, bag: &PropertyBag| -> Result<RemoteLocation> {
            let target: S3Target = bag.get_as("target")?;
            Ok(RemoteLocation::S3 {
                key: normalize_s3_prefix(&target.path).to_string(),
                bucket: target.bucket,
            })
        });
        stages.push(Arc::new(UploadStage::new(ctx, UPLOAD_FAILED, Payload::Checkout, location)));
    }

    stages
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_archive_key() {
        assert_eq!(archive_key("", "5678"), "5678.tar.gz");
        assert_eq!(archive_key("./releases/", "5678"), "releases/5678.tar.gz");
        assert_eq!(archive_key("/releases/app.tgz", "5678"), "releases/app.tgz");
    }

    #[tokio::test]
    async fn test_sync_uploads_checkout() {
        let h = harness(RecordingExecutor::default(), FakeAws::default());
        let bag = push_bag(json!({"id": "t2", "type": "s3", "bucket": "site", "path": "/www"}));
        let stages = stages(&h.ctx, false);
        let upload = stages.last().unwrap();

        let outcome = upload.run(&JobId::from("1234"), &bag).await.unwrap();
        let hal_core::stage::StageOutcome::Passed(props) = outcome else {
            panic!("expected pass");
        };
        assert_eq!(props["upload"]["key"], "www");
        assert_eq!(
            h.storage.pushed.lock().unwrap()[0],
            ("/tmp/hal/hal9000-push-1234".to_string(), "s3://site/www".to_string())
        );
        assert_eq!(h.logger.events()[0].message, "Upload to S3");
    }

    #[tokio::test]
    async fn test_archive_uploads_package() {
        let h = harness(RecordingExecutor::default(), FakeAws::default());
        let bag = push_bag(json!({"id": "t2", "type": "s3", "bucket": "site", "path": "releases/"}));
        let stages = stages(&h.ctx, true);
        stages.last().unwrap().run(&JobId::from("1234"), &bag).await.unwrap();
        assert_eq!(
            h.storage.pushed.lock().unwrap()[0],
            (
                "/tmp/hal/hal9000-1234.tar.gz".to_string(),
                "s3://site/releases/5678.tar.gz".to_string()
            )
        );
    }
}
