// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Recognize a declared application in the process table
//!
//! Matching is heuristic, it only looks at the command line: the port, the name of the entry point and the
//! keyword of the server that hosts it. Text comparisons ignore case, the port is compared as written.

use crate::app::{ApplicationRecord, RuntimeKind};
use crate::procs::snapshot::{ProcessRecord, ProcessSnapshot};

pub(crate) const STREAMLIT: &str = "streamlit";
pub(crate) const UVICORN: &str = "uvicorn";
pub(crate) const GUNICORN: &str = "gunicorn";

/// The outcome of looking for one application, `process` is `None` when it is not running
#[derive(Clone, Debug, PartialEq)]
pub struct MatchResult {
    pub name: String,
    pub process: Option<ProcessRecord>,
}

impl MatchResult {
    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }
}

/// Find the first process in the snapshot that is an instance of `app`
pub fn match_app(app: &ApplicationRecord, snapshot: &ProcessSnapshot) -> MatchResult {
    match_app_where(app, snapshot, |_| true)
}

/// Like `match_app`, but only processes accepted by `eligible` are considered
pub fn match_app_where<F>(
    app: &ApplicationRecord,
    snapshot: &ProcessSnapshot,
    eligible: F,
) -> MatchResult
where
    F: Fn(&ProcessRecord) -> bool,
{
    let process = snapshot
        .iter()
        .filter(|process| eligible(*process))
        .find(|process| is_instance(app, process))
        .cloned();

    MatchResult {
        name: app.name.clone(),
        process,
    }
}

/// Whether `process` looks like a running instance of `app`
pub fn is_instance(app: &ApplicationRecord, process: &ProcessRecord) -> bool {
    let cmdline = process.command_line();
    if cmdline.trim().is_empty() {
        // exited or not readable
        return false;
    }

    let lower = cmdline.to_lowercase();
    let file_name = app.file_name().to_lowercase();

    match (app.runtime, app.port) {
        (RuntimeKind::Streamlit, Some(port)) => {
            cmdline.contains(&port.to_string())
                && lower.contains(STREAMLIT)
                && !file_name.is_empty()
                && lower.contains(&file_name)
        }
        (RuntimeKind::FastApi, Some(port)) => {
            cmdline.contains(&port.to_string()) && lower.contains(UVICORN)
        }
        (RuntimeKind::Flask, Some(port)) => {
            cmdline.contains(&port.to_string()) && lower.contains(GUNICORN)
        }
        // scripts are not launched with their port, so it says nothing about the command line
        (RuntimeKind::Python, _) | (_, None) => {
            let path = app.file.to_string_lossy();
            process.cmdline.iter().any(|arg| *arg == path)
                || (!file_name.is_empty() && lower.contains(&file_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::record;
    use crate::procs::snapshot::MemoryUsage;

    fn process(pid: u32, cmdline: &str) -> ProcessRecord {
        ProcessRecord::new(pid, cmdline.split_whitespace().map(String::from).collect())
    }

    fn snapshot(processes: Vec<ProcessRecord>) -> ProcessSnapshot {
        ProcessSnapshot::new(processes, MemoryUsage::default())
    }

    #[test]
    fn streamlit_by_port_and_file() {
        let snapshot = snapshot(vec![
            process(10, "/bin/bash"),
            process(11, "streamlit run /x/test_app.py --server.port=8501"),
        ]);

        let app = record("test", "/x/test_app.py", Some(8501), "streamlit");
        let result = match_app(&app, &snapshot);
        assert_eq!(result.name, "test");
        assert_eq!(result.process.map(|p| p.pid), Some(11));

        let other_port = record("test", "/x/test_app.py", Some(8502), "streamlit");
        assert!(!match_app(&other_port, &snapshot).is_running());

        let other_file = record("test", "/x/other.py", Some(8501), "streamlit");
        assert!(!match_app(&other_file, &snapshot).is_running());
    }

    #[test]
    fn keywords_ignore_case() {
        let snapshot = snapshot(vec![process(
            7,
            "/opt/conda/bin/python /opt/conda/bin/Streamlit run /x/Test_App.py --server.port=8501",
        )]);
        let app = record("test", "/x/test_app.py", Some(8501), "streamlit");
        assert!(match_app(&app, &snapshot).is_running());
    }

    #[test]
    fn server_keywords() {
        let snapshot = snapshot(vec![
            process(20, "python -m http.server 8000"),
            process(21, "/env/bin/python /env/bin/uvicorn main:app --host 0.0.0.0 --port 8000"),
            process(22, "gunicorn web:app --workers 1 --bind 0.0.0.0:9000"),
        ]);

        let api = record("api", "/srv/main.py", Some(8000), "fastapi");
        assert_eq!(match_app(&api, &snapshot).process.map(|p| p.pid), Some(21));

        let web = record("web", "/srv/web.py", Some(9000), "flask");
        assert_eq!(match_app(&web, &snapshot).process.map(|p| p.pid), Some(22));

        let wrong = record("web", "/srv/web.py", Some(8000), "flask");
        assert!(!match_app(&wrong, &snapshot).is_running());
    }

    #[test]
    fn script_by_path_or_name() {
        let by_path = snapshot(vec![process(30, "/env/bin/python /jobs/nightly.py")]);
        let job = record("job", "/jobs/nightly.py", None, "python");
        assert!(match_app(&job, &by_path).is_running());

        let by_name = snapshot(vec![process(31, "python NIGHTLY.PY --full")]);
        assert!(match_app(&job, &by_name).is_running());

        let neither = snapshot(vec![process(32, "python daily.py")]);
        assert!(!match_app(&job, &neither).is_running());
    }

    #[test]
    fn empty_cmdline_never_matches() {
        let snapshot = snapshot(vec![ProcessRecord::new(40, vec![]), process(41, "   ")]);
        let job = record("job", "/jobs/nightly.py", None, "python");
        assert!(!match_app(&job, &snapshot).is_running());
    }

    #[test]
    fn empty_snapshot_is_not_running() {
        let app = record("test", "/x/test_app.py", Some(8501), "streamlit");
        let result = match_app(&app, &ProcessSnapshot::default());
        assert_eq!(
            result,
            MatchResult {
                name: "test".to_string(),
                process: None,
            }
        );
    }

    #[test]
    fn first_seen_wins() {
        let snapshot = snapshot(vec![
            process(50, "uvicorn a:app --port 8000"),
            process(51, "uvicorn b:app --port 8000"),
        ]);
        let api = record("api", "/srv/a.py", Some(8000), "fastapi");
        assert_eq!(match_app(&api, &snapshot).process.map(|p| p.pid), Some(50));

        let skip_first = match_app_where(&api, &snapshot, |p| p.pid != 50);
        assert_eq!(skip_first.process.map(|p| p.pid), Some(51));
    }
}
