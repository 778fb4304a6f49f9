// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::{HashMap, HashSet, VecDeque};
use std::process::{Command, Stdio};

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

/// One process as seen at the time of the snapshot
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent: Option<u32>,
    pub cmdline: Vec<String>,
    pub name: String,
    pub status: String,
    /// Seconds since the epoch
    pub started: u64,
    /// Resident memory as a percentage of total memory
    pub memory_percent: f32,
    /// Accelerator memory in MiB, when known
    pub accelerator_mib: Option<u64>,
}

impl ProcessRecord {
    pub fn new(pid: u32, cmdline: Vec<String>) -> Self {
        let name = cmdline
            .first()
            .map(|arg0| arg0.rsplit('/').next().unwrap_or(arg0).to_string())
            .unwrap_or_default();

        Self {
            pid,
            parent: None,
            cmdline,
            name,
            status: "Run".to_string(),
            started: 0,
            memory_percent: 0.0,
            accelerator_mib: None,
        }
    }

    /// All arguments joined by a single space
    pub fn command_line(&self) -> String {
        self.cmdline.join(" ")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryUsage {
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// All processes on the machine at one point in time
///
/// A snapshot is never updated, the next refresh replaces it.
#[derive(Clone, Debug, Default)]
pub struct ProcessSnapshot {
    processes: Vec<ProcessRecord>,
    memory: MemoryUsage,
}

impl ProcessSnapshot {
    pub fn new(processes: Vec<ProcessRecord>, memory: MemoryUsage) -> Self {
        Self { processes, memory }
    }

    /// Enumerate the live process table, this blocks
    ///
    /// Processes are ordered by pid. Processes that can not be inspected are left out.
    pub fn capture(accelerator_usage: bool) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new()
                .with_memory()
                .with_cmd(UpdateKind::Always),
        );

        let total = system.total_memory();
        let accelerator = if accelerator_usage {
            query_accelerator_usage()
        } else {
            HashMap::new()
        };

        let mut processes: Vec<ProcessRecord> = system
            .processes()
            .iter()
            // threads are listed as tasks of their process on linux
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, process)| {
                let pid = pid.as_u32();
                let memory_percent = if total > 0 {
                    (process.memory() as f64 / total as f64 * 100.0) as f32
                } else {
                    0.0
                };

                ProcessRecord {
                    pid,
                    parent: process.parent().map(|parent| parent.as_u32()),
                    cmdline: process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy().into_owned())
                        .collect(),
                    name: process.name().to_string_lossy().into_owned(),
                    status: process.status().to_string(),
                    started: process.start_time(),
                    memory_percent,
                    accelerator_mib: accelerator.get(&pid).copied(),
                }
            })
            .collect();
        processes.sort_by_key(|p| p.pid);

        debug!(count = processes.len(), "captured process snapshot");
        Self {
            processes,
            memory: MemoryUsage {
                used_bytes: system.used_memory(),
                total_bytes: total,
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.processes.iter()
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessRecord> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    /// Children, grandchildren and so on of `pid`, parents before their children
    pub fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for process in &self.processes {
            if let Some(parent) = process.parent {
                children.entry(parent).or_default().push(process.pid);
            }
        }

        let mut found = Vec::new();
        let mut seen = HashSet::from([pid]);
        let mut queue = VecDeque::from([pid]);
        while let Some(current) = queue.pop_front() {
            for &child in children.get(&current).into_iter().flatten() {
                if seen.insert(child) {
                    found.push(child);
                    queue.push_back(child);
                }
            }
        }

        found
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn memory(&self) -> MemoryUsage {
        self.memory
    }
}

/// Accelerator memory per pid, empty when `nvidia-smi` is not available
fn query_accelerator_usage() -> HashMap<u32, u64> {
    let output = Command::new("nvidia-smi")
        .args(&[
            "--query-compute-apps=pid,used_memory",
            "--format=csv,noheader,nounits",
        ])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();

    match output {
        Ok(output) if output.status.success() => {
            parse_accelerator_usage(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            debug!(status = %output.status, "nvidia-smi failed");
            HashMap::new()
        }
        Err(e) => {
            debug!(error = %e, "nvidia-smi not available");
            HashMap::new()
        }
    }
}

fn parse_accelerator_usage(csv: &str) -> HashMap<u32, u64> {
    csv.lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let pid = fields.next()?.parse().ok()?;
            let used = fields.next()?.parse().ok()?;
            Some((pid, used))
        })
        .fold(HashMap::new(), |mut usage, (pid, used): (u32, u64)| {
            *usage.entry(pid).or_insert(0) += used;
            usage
        })
}
