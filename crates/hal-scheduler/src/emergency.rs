//! Emergency cleanup guard.
//!
//! Armed before the first stage that allocates remote resources. The handler
//! runs at most once: explicitly when a job fails, or from `Drop` when the
//! pipeline future is abandoned while still armed.

use hal_core::stage::EmergencyCleanup;
use hal_core::{JobId, PropertyBag};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

pub struct EmergencyGuard {
    handler: Arc<dyn EmergencyCleanup>,
    job: JobId,
    snapshot: PropertyBag,
    done: AtomicBool,
}

impl EmergencyGuard {
    pub fn arm(handler: Arc<dyn EmergencyCleanup>, job: &JobId, bag: &PropertyBag) -> Self {
        info!(job_id = %job, "Armed emergency cleanup");
        Self {
            handler,
            job: job.clone(),
            snapshot: bag.clone(),
            done: AtomicBool::new(false),
        }
    }

    /// Replace the properties the handler will see.
    pub fn refresh(&mut self, bag: &PropertyBag) {
        self.snapshot = bag.clone();
    }

    /// Run the handler unless it already ran or the guard was disarmed.
    /// Returns whether this call ran it.
    pub async fn fire(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!(job_id = %self.job, "Running emergency cleanup");
        self.handler.cleanup(&self.job, &self.snapshot).await;
        true
    }

    pub fn disarm(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            info!(job_id = %self.job, "Disarmed emergency cleanup");
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl Drop for EmergencyGuard {
    fn drop(&mut self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }

        let handler = self.handler.clone();
        let job = self.job.clone();
        let snapshot = self.snapshot.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(job_id = %job, "Job abandoned with remote resources allocated, cleaning up");
                runtime.spawn(async move {
                    handler.cleanup(&job, &snapshot).await;
                });
            }
            Err(_) => warn!(job_id = %job, "No runtime available for emergency cleanup"),
        }
    }
}

impl fmt::Debug for EmergencyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmergencyGuard")
            .field("job", &self.job)
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct CountingCleanup {
        runs: AtomicUsize,
        notify: Notify,
    }

    #[async_trait]
    impl EmergencyCleanup for CountingCleanup {
        async fn cleanup(&self, _job: &JobId, _bag: &PropertyBag) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    fn bag() -> PropertyBag {
        PropertyBag::new("/tmp/hal").unwrap()
    }

    #[tokio::test]
    async fn test_fires_once() {
        let handler = Arc::new(CountingCleanup::default());
        let guard = EmergencyGuard::arm(handler.clone(), &JobId::from("1"), &bag());
        assert!(guard.fire().await);
        assert!(!guard.fire().await);
        drop(guard);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disarmed_guard_never_fires() {
        let handler = Arc::new(CountingCleanup::default());
        let guard = EmergencyGuard::arm(handler.clone(), &JobId::from("1"), &bag());
        guard.disarm();
        assert!(!guard.fire().await);
        drop(guard);
        tokio::task::yield_now().await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_while_armed_cleans_up() {
        let handler = Arc::new(CountingCleanup::default());
        let notified = handler.notify.notified();
        drop(EmergencyGuard::arm(handler.clone(), &JobId::from("1"), &bag()));
        notified.await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }
}
