/*!
The build orchestrator: a priority queue feeding a fixed pool of workers,
each of which resolves a build, generates its installer files, runs Packer,
and streams everything observable onto the event bus.

The in-memory registry of builds is owned exclusively by the orchestrator;
external readers get copied snapshots.  Cancellation is cooperative and
idempotent: a signal on the build's watch channel is observed by its worker
at every suspension point.  Terminated builds stay queryable for a retention
window, then a background sweep collects them unless a subscriber is still
attached.
*/

mod build;
mod queue;
mod ring;
mod worker;

pub use build::{
    detect_level, BuildId, BuildRequest, BuildSnapshot, BuildState, LogEntry, LogLevel, LogSource,
    Progress,
};
pub use ring::LogRing;

use crate::creds::CredentialProvider;
use crate::events::{EventBus, EventKind, Subscription};
use crate::index::SpecIndex;
use build::BuildRecord;
use chrono::Utc;
use osimager_config::Settings;
use queue::BuildQueue;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde_json::json;
use snafu::{ensure, OptionExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// How often the retention sweep runs.
const GC_INTERVAL: Duration = Duration::from_secs(60);

pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) settings: Settings,
    pub(crate) index: SpecIndex,
    pub(crate) creds: Option<Arc<dyn CredentialProvider>>,
    pub(crate) registry: Mutex<HashMap<BuildId, BuildRecord>>,
    pub(crate) queue: Mutex<BuildQueue>,
    pub(crate) queue_ready: Notify,
    pub(crate) bus: EventBus,
    pub(crate) shutting_down: AtomicBool,
    /// Builds currently owned by a worker; never exceeds the worker count.
    pub(crate) active: AtomicUsize,
}

impl Orchestrator {
    /// Starts the worker pool and retention sweep.  Must be called inside a
    /// tokio runtime.
    pub fn start(
        settings: Settings,
        index: SpecIndex,
        creds: Option<Arc<dyn CredentialProvider>>,
    ) -> Self {
        let workers = settings.max_concurrent_builds.max(1);
        let inner = Arc::new(Inner {
            settings,
            index,
            creds,
            registry: Mutex::new(HashMap::new()),
            queue: Mutex::new(BuildQueue::default()),
            queue_ready: Notify::new(),
            bus: EventBus::default(),
            shutting_down: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        });

        for worker_id in 0..workers {
            tokio::spawn(worker::run(inner.clone(), worker_id));
        }
        tokio::spawn(retention_sweep(inner.clone()));
        log::info!("Orchestrator started with {} worker(s)", workers);

        Self { inner }
    }

    /// Accepts a build, queues it, and returns its initial snapshot.
    pub fn submit(&self, request: BuildRequest) -> Result<BuildSnapshot> {
        ensure!(
            !self.inner.shutting_down.load(Ordering::SeqCst),
            error::ShuttingDownSnafu
        );

        let id = new_build_id();
        let record = BuildRecord::new(
            id.clone(),
            request,
            self.inner.settings.log_ring_capacity,
        );
        let snapshot = record.snapshot();

        self.inner
            .registry
            .lock()
            .unwrap()
            .insert(id.clone(), record);
        self.inner
            .queue
            .lock()
            .unwrap()
            .push(id.clone(), snapshot.priority);
        self.inner.queue_ready.notify_one();

        self.inner
            .bus
            .publish(EventKind::Created, &id, snapshot.to_value());
        log::info!(
            "Submitted build {} for {} at priority {}",
            id,
            snapshot.target,
            snapshot.priority
        );
        Ok(snapshot)
    }

    /// Requests cancellation.  Idempotent and non-blocking: a Queued build
    /// transitions immediately; a build owned by a worker is signalled and
    /// transitions when the worker observes the signal.
    pub fn cancel(&self, id: &str) -> Result<BuildSnapshot> {
        let mut registry = self.inner.registry.lock().unwrap();
        let record = registry
            .get_mut(id)
            .context(error::UnknownBuildSnafu { id })?;

        match record.state {
            BuildState::Queued => {
                record.state = BuildState::Cancelled;
                record.completed_at = Some(Utc::now());
                let _ = record.cancel_tx.send(true);
                let snapshot = record.snapshot();
                // Exactly one cancelled event; the stale queue entry is
                // skipped when a worker pops it.
                self.inner
                    .bus
                    .publish(EventKind::Cancelled, id, snapshot.to_value());
                log::info!("Cancelled queued build {}", id);
                Ok(snapshot)
            }
            state if state.is_terminal() => Ok(record.snapshot()),
            _ => {
                let _ = record.cancel_tx.send(true);
                log::info!("Signalled cancellation for active build {}", id);
                Ok(record.snapshot())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<BuildSnapshot> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .get(id)
            .map(BuildRecord::snapshot)
    }

    /// Snapshots of every retained build, newest submissions first.
    pub fn list(&self) -> Vec<BuildSnapshot> {
        let registry = self.inner.registry.lock().unwrap();
        let mut snapshots: Vec<BuildSnapshot> =
            registry.values().map(BuildRecord::snapshot).collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    /// The retained log entries for one build.
    pub fn logs(&self, id: &str) -> Option<Vec<LogEntry>> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .get(id)
            .map(|record| record.logs.iter().cloned().collect())
    }

    /// Subscribes to all builds: an initial snapshot plus the event stream.
    /// The subscription attaches before the snapshot is taken, so observers
    /// may see an event twice but never miss one.
    pub fn subscribe(&self) -> (Vec<BuildSnapshot>, Subscription) {
        let subscription = self.inner.bus.subscribe(None);
        (self.list(), subscription)
    }

    /// Subscribes to one build, with its current status delivered first.
    pub fn subscribe_build(&self, id: &str) -> Result<(BuildSnapshot, Subscription)> {
        let subscription = self.inner.bus.subscribe(Some(id.to_string()));
        let snapshot = self.get(id).context(error::UnknownBuildSnafu { id })?;
        Ok((snapshot, subscription))
    }

    pub fn unsubscribe(&self, subscription_id: u64) {
        self.inner.bus.unsubscribe(subscription_id);
    }

    /// Waits for the build to reach a terminal state.
    pub async fn wait(&self, id: &str) -> Result<BuildSnapshot> {
        loop {
            let snapshot = self.get(id).context(error::UnknownBuildSnafu { id })?;
            if snapshot.state.is_terminal() {
                return Ok(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Stops accepting submissions, signals every active build, and waits up
    /// to the grace window for workers to drain.
    pub async fn shutdown(&self, grace: Duration) {
        log::info!("Orchestrator shutting down");
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        {
            let registry = self.inner.registry.lock().unwrap();
            for record in registry.values() {
                if !record.state.is_terminal() {
                    let _ = record.cancel_tx.send(true);
                }
            }
        }
        self.inner.queue_ready.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// The number of builds currently owned by workers.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }
}

impl Inner {
    /// Appends one log entry to the build's ring and fans it out.  Both
    /// happen before any later state event for the build, which is what
    /// keeps log lines ahead of the transitions they precede.
    pub(crate) fn log(&self, id: &str, level: LogLevel, source: LogSource, message: String) {
        let entry = LogEntry::now(level, source, message);
        let data = serde_json::to_value(&entry).unwrap_or(json!(null));
        {
            let mut registry = self.registry.lock().unwrap();
            if let Some(record) = registry.get_mut(id) {
                record.logs.push(entry);
            }
        }
        self.bus.publish(EventKind::Log, id, data);
    }

    pub(crate) fn set_progress(&self, id: &str, progress: Progress) {
        let data = serde_json::to_value(&progress).unwrap_or(json!(null));
        {
            let mut registry = self.registry.lock().unwrap();
            if let Some(record) = registry.get_mut(id) {
                record.progress = Some(progress);
            }
        }
        self.bus.publish(EventKind::Progress, id, data);
    }

    /// Applies a non-terminal state transition and publishes it.
    pub(crate) fn set_state(&self, id: &str, state: BuildState) {
        let snapshot = {
            let mut registry = self.registry.lock().unwrap();
            match registry.get_mut(id) {
                Some(record) => {
                    record.state = state;
                    if state == BuildState::Running && record.started_at.is_none() {
                        record.started_at = Some(Utc::now());
                    }
                    Some(record.snapshot())
                }
                None => None,
            }
        };
        if let Some(snapshot) = snapshot {
            log::info!("Build {} -> {}", id, state);
            self.bus
                .publish(EventKind::Status, id, snapshot.to_value());
        }
    }

    /// Applies a terminal transition and publishes the terminal event.
    pub(crate) fn finish(
        &self,
        id: &str,
        state: BuildState,
        error: Option<(String, i32)>,
    ) {
        let snapshot = {
            let mut registry = self.registry.lock().unwrap();
            match registry.get_mut(id) {
                Some(record) => {
                    record.state = state;
                    record.completed_at = Some(Utc::now());
                    if let Some((message, exit_code)) = error {
                        record.error_message = Some(message);
                        record.error_exit_code = Some(exit_code);
                    }
                    Some(record.snapshot())
                }
                None => None,
            }
        };
        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => return,
        };

        let kind = match state {
            BuildState::Completed => EventKind::Completed,
            BuildState::Cancelled => EventKind::Cancelled,
            // Timeouts surface as failures on the wire; the state in the
            // payload still says timed_out.
            _ => EventKind::Failed,
        };
        log::info!("Build {} -> {}", id, state);
        self.bus.publish(kind, id, snapshot.to_value());
    }

    pub(crate) fn workspace_of(&self, id: &str) -> Option<std::path::PathBuf> {
        self.registry
            .lock()
            .unwrap()
            .get(id)
            .and_then(|record| record.workspace.clone())
    }
}

/// Periodically drops terminated builds past the retention window, unless a
/// subscriber is still watching them.
async fn retention_sweep(inner: Arc<Inner>) {
    let retention =
        chrono::Duration::seconds(inner.settings.retention_secs.min(i64::MAX as u64) as i64);
    let mut interval = tokio::time::interval(GC_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if inner.shutting_down.load(Ordering::SeqCst) {
            break;
        }

        let cutoff = Utc::now() - retention;
        let mut registry = inner.registry.lock().unwrap();
        registry.retain(|id, record| {
            let expired = record.state.is_terminal()
                && record
                    .completed_at
                    .map(|done| done < cutoff)
                    .unwrap_or(false);
            if expired && !inner.bus.has_subscriber_for(id) {
                log::debug!("Retention sweep dropping build {}", id);
                false
            } else {
                true
            }
        });
    }
}

fn new_build_id() -> BuildId {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("osb-{}", suffix)
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Orchestrator is shutting down; not accepting builds"))]
        ShuttingDown,

        #[snafu(display("No build with id '{}'", id))]
        UnknownBuild { id: String },
    }
}
pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use crate::assembly::BuildTarget;
    use crate::events::EventKind;

    fn settings(dir: &std::path::Path) -> Settings {
        let conf = format!(
            "data_dir = {:?}\nuser_dir = {:?}\ninstaller_dir = {:?}\ntemp_dir = {:?}\n",
            dir.join("data"),
            dir.join("user"),
            dir.join("installer"),
            dir.join("tmp"),
        );
        let path = dir.join("osimager.conf");
        std::fs::write(&path, conf).unwrap();
        Settings::from_path(&path).unwrap()
    }

    fn request() -> BuildRequest {
        BuildRequest::new("vmware/lab/rhel-9.5-x86_64".parse::<BuildTarget>().unwrap())
    }

    #[tokio::test]
    async fn queued_build_cancels_without_running() {
        let dir = tempfile::tempdir().unwrap();
        // The test runtime is single-threaded, so no worker runs between the
        // synchronous submit and cancel below.
        let orchestrator = Orchestrator::start(
            settings(dir.path()),
            SpecIndex::default(),
            None,
        );

        let (_, mut subscription) = orchestrator.subscribe();

        let mut req = request();
        req.priority = 5;
        let submitted = orchestrator.submit(req).unwrap();
        assert_eq!(submitted.state, BuildState::Queued);

        let cancelled = orchestrator.cancel(&submitted.id).unwrap();
        assert_eq!(cancelled.state, BuildState::Cancelled);
        // idempotent: a second cancel changes nothing
        let again = orchestrator.cancel(&submitted.id).unwrap();
        assert_eq!(again.state, BuildState::Cancelled);
        assert!(cancelled.workspace.is_none());
        assert!(cancelled.started_at.is_none());

        // exactly one cancelled event
        let mut cancelled_events = 0;
        while let Ok(event) = subscription.rx.try_recv() {
            if event.kind == EventKind::Cancelled {
                cancelled_events += 1;
            }
            assert_ne!(event.kind, EventKind::Status, "never transitioned");
        }
        assert_eq!(cancelled_events, 1);
    }

    #[tokio::test]
    async fn unknown_build_errors() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            Orchestrator::start(settings(dir.path()), SpecIndex::default(), None);
        assert!(matches!(
            orchestrator.cancel("osb-nope").unwrap_err(),
            Error::UnknownBuild { .. }
        ));
        assert!(orchestrator.get("osb-nope").is_none());
    }

    #[tokio::test]
    async fn shutdown_refuses_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            Orchestrator::start(settings(dir.path()), SpecIndex::default(), None);
        orchestrator.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(
            orchestrator.submit(request()).unwrap_err(),
            Error::ShuttingDown
        ));
    }

    #[tokio::test]
    async fn dry_run_build_completes_through_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        // A minimal library the worker can resolve end to end.
        let write = |rel: &str, contents: String| {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        };
        write(
            "data/platforms/vmware.json",
            serde_json::json!({
                "defs": {"thin_disk": false},
                "config": {
                    "type": "vmware-iso",
                    "iso_url": ">>iso_url<<",
                    "disk_thin_provisioned": "%>thin_disk<%"
                }
            })
            .to_string(),
        );
        write(
            "user/locations/lab.json",
            serde_json::json!({
                "defs": {"domain": "lab.example.com", "network": "10.1.2.0/24"}
            })
            .to_string(),
        );
        write(
            "data/specs/rhel/spec.json",
            serde_json::json!({
                "provides": {"dist": "rhel", "versions": ["9.5"], "arches": ["x86_64"]},
                "defs": {"iso_url": "https://mirror.example.com/rhel-9.5-x86_64.iso"},
                "files": [{"sources": ["ks/rhel.cfg"], "dest": "ks.cfg"}]
            })
            .to_string(),
        );
        write(
            "installer/ks/rhel.cfg",
            "network --hostname=>>fqdn<< --netmask=>>netmask<<\n".to_string(),
        );
        std::fs::create_dir_all(root.join("isos")).unwrap();
        std::fs::write(root.join("isos/rhel-9.5-x86_64.iso"), b"iso").unwrap();

        let conf = format!(
            "data_dir = {:?}\nuser_dir = {:?}\ninstaller_dir = {:?}\ntemp_dir = {:?}\niso_dir = {:?}\n",
            root.join("data"),
            root.join("user"),
            root.join("installer"),
            root.join("tmp"),
            root.join("isos"),
        );
        std::fs::write(root.join("osimager.conf"), conf).unwrap();
        let settings = Settings::from_path(root.join("osimager.conf")).unwrap();
        let index = SpecIndex::build(&settings.data_dir, &settings.iso_dir()).unwrap();

        let orchestrator = Orchestrator::start(settings, index, None);

        let mut req = request();
        req.dry_run = true;
        req.options.ip = Some("10.1.2.50".to_string());
        req.options.local_only = true;
        let submitted = orchestrator.submit(req).unwrap();

        let finished = orchestrator.wait(&submitted.id).await.unwrap();
        assert_eq!(finished.state, BuildState::Completed);
        assert_eq!(finished.error_message, None);

        // The workspace was cleaned on the terminal transition.
        let workspace = finished.workspace.expect("workspace recorded");
        assert!(!workspace.exists());

        // Progress reached the cleanup step and the dry run was logged.
        assert_eq!(finished.progress.unwrap().current_step, "cleanup");
        let logs = orchestrator.logs(&submitted.id).unwrap();
        assert!(logs
            .iter()
            .any(|entry| entry.message.contains("Dry run; would invoke: packer build")));
    }

    #[tokio::test]
    async fn failed_resolution_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            Orchestrator::start(settings(dir.path()), SpecIndex::default(), None);

        // The target is not in the (empty) index, so a worker fails the
        // build during Preparing.
        let submitted = orchestrator.submit(request()).unwrap();
        let finished = orchestrator.wait(&submitted.id).await.unwrap();
        assert_eq!(finished.state, BuildState::Failed);
        assert!(finished.error_message.unwrap().contains("spec index"));
        assert_eq!(finished.error_exit_code, Some(1));
        assert_eq!(orchestrator.active_count(), 0);
    }
}
