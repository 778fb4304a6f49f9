// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::ApplicationRecord;
use crate::config::Settings;
use crate::error::ErrorKind;
use crate::host::Host;
use crate::procs::controller::{ProcessController, Stopped};
use crate::procs::matcher::{is_instance, match_app_where};
use crate::procs::snapshot::{ProcessRecord, ProcessSnapshot};
use crate::registry::AppRegistry;
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppState {
    Stopped,
    /// Launched, not seen yet, and still inside the starting grace period
    Starting,
    Running,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppState::Stopped => "stopped",
            AppState::Starting => "starting",
            AppState::Running => "running",
        };
        f.pad(s)
    }
}

/// What the last refresh found for one application
#[derive(Clone, Debug, PartialEq)]
pub struct AppStatus {
    pub state: AppState,
    pub process: Option<ProcessRecord>,
}

impl AppStatus {
    pub fn running(&self) -> bool {
        self.state == AppState::Running
    }

    fn stopped() -> Self {
        Self {
            state: AppState::Stopped,
            process: None,
        }
    }
}

/// A start or stop running as its own task
pub struct OpHandle<T> {
    cancel: CancellationToken,
    handle: JoinHandle<Result<T, Error>>,
}

impl<T> OpHandle<T> {
    /// Abandon the operation, an abandoned start is not retried
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<T, Error> {
        self.handle
            .await
            .map_err(|e| Error::from(format!("operation task failed: {}", e)))?
    }
}

/// Tracks every declared application
///
/// Rules:
///   - each refresh takes a new snapshot and recomputes every status, nothing is patched
///   - applications claim processes in registry order, a process claimed once is not seen by later applications
///   - start and stop refresh when they are done
pub struct Supervisor<H: Host> {
    registry: AppRegistry,
    settings: Arc<Settings>,
    host: Arc<H>,
    controller: ProcessController<H>,
    snapshot: RwLock<Arc<ProcessSnapshot>>,
    statuses: RwLock<HashMap<String, AppStatus>>,
    /// Unconfirmed starts, by application name
    starting: Mutex<HashMap<String, Instant>>,
}

impl<H: Host> Supervisor<H> {
    pub fn new(registry: AppRegistry, settings: Arc<Settings>, host: Arc<H>) -> Self {
        let controller = ProcessController::new(Arc::clone(&host), Arc::clone(&settings));
        let statuses = registry
            .iter()
            .map(|app| (app.name.clone(), AppStatus::stopped()))
            .collect();

        Self {
            registry,
            settings,
            host,
            controller,
            snapshot: RwLock::new(Arc::new(ProcessSnapshot::default())),
            statuses: RwLock::new(statuses),
            starting: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The snapshot taken by the last refresh
    pub async fn snapshot(&self) -> Arc<ProcessSnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// Statuses of the last refresh
    pub async fn statuses(&self) -> HashMap<String, AppStatus> {
        self.statuses.read().await.clone()
    }

    pub async fn status(&self, name: &str) -> Option<AppStatus> {
        self.statuses.read().await.get(name).cloned()
    }

    /// Take a new snapshot and recompute the status of every application
    pub async fn refresh(&self) -> Result<HashMap<String, AppStatus>, Error> {
        let snapshot = Arc::new(self.host.snapshot().await?);

        let mut starting = self.starting.lock().await;
        let grace = self.settings.starting_grace();
        let mut statuses = HashMap::with_capacity(self.registry.len());

        for (app, found) in self.claim(&snapshot, None) {
            let status = match found {
                Some(process) => {
                    starting.remove(&app.name);
                    AppStatus {
                        state: AppState::Running,
                        process: Some(process),
                    }
                }
                None => match starting.get(&app.name).copied() {
                    Some(since) if since.elapsed() < grace => AppStatus {
                        state: AppState::Starting,
                        process: None,
                    },
                    Some(_) => {
                        debug!(app = %app.name, "starting grace expired");
                        starting.remove(&app.name);
                        AppStatus::stopped()
                    }
                    None => AppStatus::stopped(),
                },
            };

            statuses.insert(app.name.clone(), status);
        }
        drop(starting);

        *self.snapshot.write().await = snapshot;
        *self.statuses.write().await = statuses.clone();
        Ok(statuses)
    }

    /// Start the application `name` unless it is already running, then refresh
    pub async fn start(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ProcessRecord, Error> {
        let app = self.app(name)?;

        if let Some(process) = self.refresh().await?.remove(name).and_then(|s| s.process) {
            info!(app = %name, pid = process.pid, "already running");
            return Ok(process);
        }

        // confirmed the same way refresh sees it, earlier applications keep their processes
        let result = self
            .controller
            .start_confirmed_by(app, cancel, |snapshot| {
                self.claim(snapshot, Some(name))
                    .pop()
                    .and_then(|(_, process)| process)
            })
            .await;
        let unconfirmed = matches!(
            result.as_ref().map_err(Error::kind),
            Err(ErrorKind::ConfirmationTimeout { .. })
        );
        if unconfirmed && !self.settings.starting_grace().is_zero() {
            self.starting
                .lock()
                .await
                .insert(name.to_string(), Instant::now());
        }

        self.refresh().await?;
        result
    }

    /// Stop the application `name` if it is running, then refresh
    ///
    /// Stopping an application that is not running succeeds with `Stopped::AlreadyGone`.
    pub async fn stop(&self, name: &str) -> Result<Stopped, Error> {
        self.app(name)?;
        self.starting.lock().await.remove(name);

        let process = self.refresh().await?.remove(name).and_then(|s| s.process);
        let stopped = match process {
            Some(process) => self.controller.stop(&process).await,
            None => {
                debug!(app = %name, "not running");
                Ok(Stopped::AlreadyGone)
            }
        };

        self.refresh().await?;
        stopped
    }

    /// The process of each application in registry order, up to and including `until`
    ///
    /// An application only sees the processes not already claimed by the applications before it.
    fn claim<'s>(
        &'s self,
        snapshot: &ProcessSnapshot,
        until: Option<&str>,
    ) -> Vec<(&'s ApplicationRecord, Option<ProcessRecord>)> {
        let mut claimed = HashSet::new();
        let mut found = Vec::with_capacity(self.registry.len());

        for app in self.registry.iter() {
            let process = match_app_where(app, snapshot, |p| !claimed.contains(&p.pid)).process;
            match process {
                Some(ref process) => {
                    claimed.insert(process.pid);
                }
                None => warn_if_shadowed(app, snapshot, &claimed),
            }

            found.push((app, process));
            if until == Some(app.name.as_str()) {
                break;
            }
        }

        found
    }

    fn app(&self, name: &str) -> Result<&ApplicationRecord, Error> {
        self.registry
            .get(name)
            .ok_or_else(|| ErrorKind::UnknownApp(name.to_string()).into())
    }
}

impl<H: Host> Supervisor<H> {
    /// Run `start` as its own task, so that a slow start does not hold up anything else
    pub fn spawn_start(self: &Arc<Self>, name: &str) -> OpHandle<ProcessRecord> {
        let cancel = CancellationToken::new();
        let supervisor = Arc::clone(self);
        let name = name.to_string();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { supervisor.start(&name, &token).await });

        OpHandle { cancel, handle }
    }

    /// Run `stop` as its own task
    pub fn spawn_stop(self: &Arc<Self>, name: &str) -> OpHandle<Stopped> {
        let cancel = CancellationToken::new();
        let supervisor = Arc::clone(self);
        let name = name.to_string();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(Error::from("stop was cancelled")),
                stopped = supervisor.stop(&name) => stopped,
            }
        });

        OpHandle { cancel, handle }
    }
}

/// A process that would have matched `app` was already claimed by an earlier application
fn warn_if_shadowed(app: &ApplicationRecord, snapshot: &ProcessSnapshot, claimed: &HashSet<u32>) {
    if let Some(process) = snapshot
        .iter()
        .find(|p| claimed.contains(&p.pid) && is_instance(app, p))
    {
        warn!(app = %app.name, pid = process.pid, "process already claimed by another application");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use nix::sys::signal::Signal;

    use super::*;
    use crate::app::tests::record;
    use crate::procs::testing::{child, process, FakeHost};

    fn supervisor(
        apps: Vec<ApplicationRecord>,
        host: &Arc<FakeHost>,
        dir: &tempfile::TempDir,
        grace_ms: u64,
    ) -> Supervisor<FakeHost> {
        let settings = Settings {
            scripts_dir: dir.path().to_path_buf(),
            logs_dir: dir.path().to_path_buf(),
            starting_grace_ms: grace_ms,
            ..Settings::default()
        };
        Supervisor::new(
            AppRegistry::new(apps).unwrap(),
            Arc::new(settings),
            Arc::clone(host),
        )
    }

    #[tokio::test]
    async fn refresh_reports_each_app() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::with_processes(vec![
            process(1, "/sbin/init"),
            process(12, "streamlit run /x/test_app.py --server.port=8501"),
        ]));
        let sup = supervisor(
            vec![
                record("dash", "/x/test_app.py", Some(8501), "streamlit"),
                record("api", "/srv/main.py", Some(8000), "fastapi"),
            ],
            &host,
            &dir,
            0,
        );

        let statuses = sup.refresh().await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses["dash"].running());
        assert_eq!(statuses["dash"].process.as_ref().map(|p| p.pid), Some(12));
        assert_eq!(statuses["api"], AppStatus::stopped());
        assert_eq!(sup.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn earlier_app_claims_shared_process() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::with_processes(vec![process(
            30,
            "uvicorn main:app --host 0.0.0.0 --port 8000",
        )]));
        let sup = supervisor(
            vec![
                record("first", "/srv/main.py", Some(8000), "fastapi"),
                record("second", "/srv/other.py", Some(8000), "fastapi"),
            ],
            &host,
            &dir,
            0,
        );

        let statuses = sup.refresh().await.unwrap();
        assert_eq!(statuses["first"].process.as_ref().map(|p| p.pid), Some(30));
        assert!(!statuses["second"].running());
        assert!(statuses["second"].process.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn plain_script_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let app = record("job", "/jobs/nightly.py", None, "python");
        let sup = supervisor(vec![app], &host, &dir, 0);

        assert_eq!(sup.refresh().await.unwrap()["job"].state, AppState::Stopped);

        host.appear_on_spawn(process(
            4242,
            "conda run --no-capture-output -n base python /jobs/nightly.py",
        ));
        let before = host.snapshots.load(Ordering::SeqCst);
        let started = sup.start("job", &CancellationToken::new()).await.unwrap();
        assert_eq!(started.pid, 4242);

        // one refresh before the launch, at most five polls, one refresh after
        let polls = host.snapshots.load(Ordering::SeqCst) - before - 2;
        assert!((1..=5).contains(&polls), "{} polls", polls);

        let script = std::fs::read_to_string(dir.path().join("job.sh")).unwrap();
        let spawned = host.spawned.lock().unwrap().clone();
        assert_eq!(spawned, vec![dir.path().join("job.sh")]);
        assert!(script.contains("python /jobs/nightly.py"));

        let status = sup.status("job").await.unwrap();
        assert_eq!(status.state, AppState::Running);
        assert_eq!(status.process.map(|p| p.pid), Some(4242));

        assert_eq!(sup.stop("job").await.unwrap(), Stopped::Gracefully);
        assert_eq!(sup.refresh().await.unwrap()["job"].state, AppState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_not_confirmed_by_a_claimed_process() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::with_processes(vec![process(
            12,
            "streamlit run /a/app.py --server.port=8501",
        )]));
        let sup = supervisor(
            vec![
                record("dash", "/a/app.py", Some(8501), "streamlit"),
                record("job", "/b/app.py", None, "python"),
            ],
            &host,
            &dir,
            0,
        );

        let err = sup.start("job", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConfirmationTimeout { .. }));
        assert_eq!(sup.status("job").await.unwrap().state, AppState::Stopped);
        assert_eq!(
            sup.status("dash").await.unwrap().process.map(|p| p.pid),
            Some(12)
        );

        host.appear_on_spawn(process(30, "python /b/app.py"));
        let started = sup.start("job", &CancellationToken::new()).await.unwrap();
        assert_eq!(started.pid, 30);
        assert_eq!(
            sup.status("job").await.unwrap().process.map(|p| p.pid),
            Some(30)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_wrapper_does_not_leave_app_running() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::with_processes(vec![
            process(40, "/bin/sh /venv/bin/python /jobs/nightly.py"),
            child(41, 40, "/venv/bin/python.real /jobs/nightly.py"),
        ]));
        let sup = supervisor(
            vec![record("job", "/jobs/nightly.py", None, "python")],
            &host,
            &dir,
            0,
        );

        assert_eq!(
            sup.refresh().await.unwrap()["job"].process.as_ref().map(|p| p.pid),
            Some(40)
        );
        assert_eq!(sup.stop("job").await.unwrap(), Stopped::Gracefully);
        assert_eq!(sup.status("job").await.unwrap().state, AppState::Stopped);
        assert!(!host.is_alive(41));
    }

    #[tokio::test(start_paused = true)]
    async fn start_of_running_app_does_not_relaunch() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::with_processes(vec![process(9, "python /jobs/nightly.py")]));
        let sup = supervisor(
            vec![record("job", "/jobs/nightly.py", None, "python")],
            &host,
            &dir,
            0,
        );

        let process = sup.start("job", &CancellationToken::new()).await.unwrap();
        assert_eq!(process.pid, 9);
        assert!(host.spawned.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_start_is_stopped_without_grace() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let sup = supervisor(
            vec![record("job", "/jobs/nightly.py", None, "python")],
            &host,
            &dir,
            0,
        );

        let err = sup.start("job", &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_advisory());
        assert_eq!(sup.status("job").await.unwrap().state, AppState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_start_is_starting_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let sup = supervisor(
            vec![record("job", "/jobs/nightly.py", None, "python")],
            &host,
            &dir,
            10_000,
        );

        assert!(sup.start("job", &CancellationToken::new()).await.is_err());
        assert_eq!(sup.status("job").await.unwrap().state, AppState::Starting);

        // comes up late
        host.add(process(77, "python /jobs/nightly.py"));
        assert_eq!(sup.refresh().await.unwrap()["job"].state, AppState::Running);

        // gone again, the grace period is not reused
        host.signal(77, Signal::SIGKILL).unwrap();
        assert_eq!(sup.refresh().await.unwrap()["job"].state, AppState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_grace_expires() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let sup = supervisor(
            vec![record("job", "/jobs/nightly.py", None, "python")],
            &host,
            &dir,
            10_000,
        );

        assert!(sup.start("job", &CancellationToken::new()).await.is_err());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(sup.refresh().await.unwrap()["job"].state, AppState::Stopped);
    }

    #[tokio::test]
    async fn unknown_app() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let sup = supervisor(vec![], &host, &dir, 0);

        let err = sup.stop("nope").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnknownApp(_)));
        let err = sup.start("nope", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnknownApp(_)));
    }

    #[tokio::test]
    async fn stop_of_stopped_app_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let sup = supervisor(
            vec![record("job", "/jobs/nightly.py", None, "python")],
            &host,
            &dir,
            0,
        );

        assert_eq!(sup.stop("job").await.unwrap(), Stopped::AlreadyGone);
        assert!(host.signals.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_start_can_be_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let sup = Arc::new(supervisor(
            vec![record("job", "/jobs/nightly.py", None, "python")],
            &host,
            &dir,
            0,
        ));

        let op = sup.spawn_start("job");
        op.cancel();
        let err = op.join().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Cancelled { .. }));
        assert_eq!(sup.status("job").await.unwrap().state, AppState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_stop_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::with_processes(vec![process(9, "python /jobs/nightly.py")]));
        let sup = Arc::new(supervisor(
            vec![record("job", "/jobs/nightly.py", None, "python")],
            &host,
            &dir,
            0,
        ));

        let stopped = sup.spawn_stop("job").join().await.unwrap();
        assert_eq!(stopped, Stopped::Gracefully);
        assert!(!sup.status("job").await.unwrap().running());
    }
}
