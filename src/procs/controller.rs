// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::ApplicationRecord;
use crate::config::Settings;
use crate::error::ErrorKind;
use crate::host::Host;
use crate::procs::launcher::LaunchPlanner;
use crate::procs::matcher::match_app;
use crate::procs::snapshot::{ProcessRecord, ProcessSnapshot};
use crate::Error;

/// How a process went away
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stopped {
    /// It was already gone when the stop was requested
    AlreadyGone,
    /// It exited after SIGTERM
    Gracefully,
    /// It had to be killed
    Forced,
}

/// Starts and stops single applications
///
/// Rules:
///   - a start is only successful once the application is seen in the process table
///   - a stop always ends in SIGKILL when SIGTERM was not enough, and never sends it twice
pub struct ProcessController<H: Host> {
    host: Arc<H>,
    settings: Arc<Settings>,
}

impl<H: Host> Clone for ProcessController<H> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<H: Host> ProcessController<H> {
    pub fn new(host: Arc<H>, settings: Arc<Settings>) -> Self {
        Self { host, settings }
    }

    /// Launch `app` and wait until it shows up in the process table
    ///
    /// Polls `start_attempts` times, `start_delay` apart. Running out of attempts is an advisory
    /// `ConfirmationTimeout`, the application may still come up later.
    pub async fn start(
        &self,
        app: &ApplicationRecord,
        cancel: &CancellationToken,
    ) -> Result<ProcessRecord, Error> {
        self.start_confirmed_by(app, cancel, |snapshot| match_app(app, snapshot).process)
            .await
    }

    /// Like `start`, with `confirm` deciding which process in a snapshot, if any, is `app`
    pub async fn start_confirmed_by<F>(
        &self,
        app: &ApplicationRecord,
        cancel: &CancellationToken,
        confirm: F,
    ) -> Result<ProcessRecord, Error>
    where
        F: Fn(&ProcessSnapshot) -> Option<ProcessRecord>,
    {
        let artifact = LaunchPlanner::new(&self.settings).plan(app)?;
        let script = artifact
            .persist(&self.settings.scripts_dir)
            .await
            .map_err(|e| Error::launch(&app.name, e))?;

        info!(app = %app.name, script = %script.display(), "launching");
        self.host
            .spawn(&script)
            .await
            .map_err(|e| Error::launch(&app.name, e))?;

        let attempts = self.settings.start_attempts;
        let delay = self.settings.start_delay();
        for attempt in 1..=attempts {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(app = %app.name, attempt, "start cancelled");
                    return Err(ErrorKind::Cancelled { app: app.name.clone() }.into());
                }
                _ = sleep(delay) => (),
            }

            let snapshot = self.host.snapshot().await?;
            if let Some(process) = confirm(&snapshot) {
                info!(app = %app.name, pid = process.pid, attempt, "running");
                return Ok(process);
            }

            debug!(app = %app.name, attempt, "not running yet");
        }

        warn!(app = %app.name, attempts, "no process seen after launch");
        Err(ErrorKind::ConfirmationTimeout {
            app: app.name.clone(),
            attempts,
        }
        .into())
    }

    /// Stop `process` and everything it started, SIGTERM first and SIGKILL for whatever has not
    /// exited within `stop_timeout`
    ///
    /// Children are signalled before their parents. A process that no longer exists counts as
    /// stopped, only a failing SIGKILL is an error.
    pub async fn stop(&self, process: &ProcessRecord) -> Result<Stopped, Error> {
        let pid = process.pid;
        let mut tree = vec![pid];
        tree.extend(self.host.snapshot().await?.descendants(pid));

        info!(pid, children = tree.len() - 1, "stopping");
        let mut signalled = Vec::with_capacity(tree.len());
        for &member in tree.iter().rev() {
            match self.host.signal(member, Signal::SIGTERM) {
                Ok(()) => signalled.push(member),
                Err(Errno::ESRCH) => debug!(pid = member, "already gone"),
                Err(e) => {
                    warn!(pid = member, error = %e, "SIGTERM failed");
                    signalled.push(member);
                }
            }
        }

        if signalled.is_empty() {
            return Ok(Stopped::AlreadyGone);
        }
        if self.wait_for_exit(&signalled).await {
            info!(pid, "stopped");
            return Ok(Stopped::Gracefully);
        }
        warn!(pid, timeout_ms = self.settings.stop_timeout_ms, "still running after SIGTERM");

        let mut failed = None;
        for &member in signalled.iter().filter(|&&member| self.host.is_alive(member)) {
            match self.host.signal(member, Signal::SIGKILL) {
                // exited between the timeout and the kill
                Ok(()) | Err(Errno::ESRCH) => info!(pid = member, "killed"),
                Err(source) => {
                    warn!(pid = member, error = %source, "SIGKILL failed");
                    if failed.is_none() {
                        failed = Some(ErrorKind::StopEscalation { pid: member, source });
                    }
                }
            }
        }

        match failed {
            Some(kind) => Err(kind.into()),
            None => Ok(Stopped::Forced),
        }
    }

    async fn wait_for_exit(&self, pids: &[u32]) -> bool {
        let deadline = Instant::now() + self.settings.stop_timeout();
        loop {
            if pids.iter().all(|&pid| !self.host.is_alive(pid)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.settings.stop_poll()).await;
        }
    }
}
