// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Everything the supervisor needs from the operating system

use std::io;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{setsid, Pid};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::debug;

use crate::procs::ProcessSnapshot;
use crate::Error;

/// The process table and process control of the machine
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Enumerate all processes
    async fn snapshot(&self) -> Result<ProcessSnapshot, Error>;

    /// Run a launch script, returns once the script itself has exited
    async fn spawn(&self, script: &Path) -> io::Result<()>;

    /// Send `signal` to `pid`, `ESRCH` means the process does not exist
    fn signal(&self, pid: u32, signal: Signal) -> nix::Result<()>;

    /// Whether `pid` is still a live (non zombie) process
    fn is_alive(&self, pid: u32) -> bool;
}

/// The machine this is running on
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalHost {
    accelerator_usage: bool,
}

impl LocalHost {
    pub fn new(accelerator_usage: bool) -> Self {
        Self { accelerator_usage }
    }
}

#[async_trait]
impl Host for LocalHost {
    async fn snapshot(&self) -> Result<ProcessSnapshot, Error> {
        let accelerator_usage = self.accelerator_usage;
        tokio::task::spawn_blocking(move || ProcessSnapshot::capture(accelerator_usage))
            .await
            .map_err(|e| Error::from(format!("process enumeration failed: {}", e)))
    }

    async fn spawn(&self, script: &Path) -> io::Result<()> {
        let mut command = Command::new("bash");
        command
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        // SAFETY: pre_exec runs in the forked child before exec, setsid only touches the child. A new
        // session keeps the application alive when the supervisor's terminal goes away.
        unsafe {
            command.pre_exec(|| {
                setsid()?;
                Ok(())
            });
        }

        let output = command.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("launch script exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        debug!(script = %script.display(), "launch script finished");
        Ok(())
    }

    fn signal(&self, pid: u32, signal: Signal) -> nix::Result<()> {
        kill(Pid::from_raw(pid as i32), signal)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new(),
        );

        match system.process(pid) {
            Some(process) => process.status() != ProcessStatus::Zombie,
            None => false,
        }
    }
}
