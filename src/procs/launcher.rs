// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::borrow::Cow;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use shell_escape::unix::escape;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::app::{ApplicationRecord, EnvironmentKind, RuntimeKind};
use crate::config::Settings;
use crate::procs::matcher::{GUNICORN, STREAMLIT, UVICORN};
use crate::Error;

const SHEBANG: &str = "#!/bin/bash";
const SCRIPT_MODE: u32 = 0o744;
const WSGI_WORKERS: u32 = 1;

/// A shell script that starts one application in the background
///
/// Generated fresh for every start, identical records always produce identical scripts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchArtifact {
    file_stem: String,
    statements: Vec<String>,
    invocation: String,
}

impl LaunchArtifact {
    /// Environment, activation and working directory, in order
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// The backgrounded command line of the application itself
    pub fn invocation(&self) -> &str {
        &self.invocation
    }

    /// The full script text
    pub fn render(&self) -> String {
        let mut script = String::new();
        script.push_str(SHEBANG);
        script.push('\n');
        // a failed activation must not launch the app in the wrong environment
        script.push_str("set -e\n");
        for statement in &self.statements {
            script.push_str(statement);
            script.push('\n');
        }
        script.push_str(&self.invocation);
        script.push('\n');
        script
    }

    pub fn script_path(&self, scripts_dir: &Path) -> PathBuf {
        scripts_dir.join(format!("{}.sh", self.file_stem))
    }

    /// Write the script to the scripts directory, replacing any earlier script of the same application
    ///
    /// The file is synced and executable once this returns.
    pub async fn persist(&self, scripts_dir: &Path) -> Result<PathBuf, Error> {
        let path = self.script_path(scripts_dir);

        let mut file = fs::File::create(&path).await?;
        file.write_all(self.render().as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::set_permissions(&path, std::fs::Permissions::from_mode(SCRIPT_MODE)).await?;

        debug!(path = %path.display(), "wrote launch script");
        Ok(path)
    }
}

/// Builds launch scripts for declared applications
#[derive(Clone, Copy, Debug)]
pub struct LaunchPlanner<'a> {
    settings: &'a Settings,
}

impl<'a> LaunchPlanner<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    /// Where the output of `app` goes, truncated on every start
    pub fn log_path(&self, app: &ApplicationRecord) -> PathBuf {
        self.settings
            .logs_dir
            .join(format!("{}.out", app.file_stem()))
    }

    /// Plan the launch of `app`
    ///
    /// The only I/O is the check that a virtual environment's interpreter exists.
    pub fn plan(&self, app: &ApplicationRecord) -> Result<LaunchArtifact, Error> {
        let mut statements = Vec::new();

        for (key, value) in &app.env_vars {
            statements.push(format!("export {}={}", key, quote(value)));
        }

        match app.environment {
            EnvironmentKind::Conda(ref env) => {
                statements.push(format!("source {}", quote_path(&self.settings.conda_hook)));
                statements.push(format!("conda activate {}", quote(env)));
            }
            EnvironmentKind::Venv(ref activate) => {
                statements.push(format!("source {}", quote_path(activate)));
            }
        }

        statements.push(format!("cd {}", quote_path(app.working_directory())));

        let mut invocation = vec!["nohup".to_string()];
        invocation.extend(self.command(app)?);
        invocation.extend(app.flags.iter().cloned());
        invocation.push("&>".to_string());
        invocation.push(quote_path(&self.log_path(app)));
        invocation.push("&".to_string());

        Ok(LaunchArtifact {
            file_stem: app.file_stem(),
            statements,
            invocation: invocation.join(" "),
        })
    }

    fn command(&self, app: &ApplicationRecord) -> Result<Vec<String>, Error> {
        let file = quote_path(&app.file);

        let command = match app.runtime {
            RuntimeKind::Streamlit => vec![
                STREAMLIT.to_string(),
                "run".to_string(),
                file,
                format!("--server.port={}", required_port(app)?),
                "--server.fileWatcherType=none".to_string(),
                "--server.headless=true".to_string(),
                "--browser.gatherUsageStats=false".to_string(),
            ],
            RuntimeKind::FastApi => vec![
                UVICORN.to_string(),
                module_reference(app)?,
                "--host".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                required_port(app)?.to_string(),
            ],
            RuntimeKind::Flask => vec![
                GUNICORN.to_string(),
                module_reference(app)?,
                "--workers".to_string(),
                WSGI_WORKERS.to_string(),
                "--bind".to_string(),
                format!("0.0.0.0:{}", required_port(app)?),
            ],
            RuntimeKind::Python => match app.environment {
                EnvironmentKind::Conda(ref env) => vec![
                    "conda".to_string(),
                    "run".to_string(),
                    "--no-capture-output".to_string(),
                    "-n".to_string(),
                    quote(env),
                    "python".to_string(),
                    file,
                ],
                EnvironmentKind::Venv(ref activate) => {
                    let interpreter = activate.with_file_name("python");
                    if !interpreter.is_file() {
                        return Err(Error::planning(
                            &app.name,
                            format!(
                                "interpreter not resolvable: {} does not exist",
                                interpreter.display()
                            ),
                        ));
                    }
                    vec![quote_path(&interpreter), file]
                }
            },
        };

        Ok(command)
    }
}

fn required_port(app: &ApplicationRecord) -> Result<u16, Error> {
    app.port
        .ok_or_else(|| Error::planning(&app.name, format!("{} requires a port", app.runtime)))
}

/// `module:app` for the entry point, `/srv/main.py` becomes `main:app`
fn module_reference(app: &ApplicationRecord) -> Result<String, Error> {
    app.file
        .file_stem()
        .map(|stem| quote(&format!("{}:app", stem.to_string_lossy())))
        .ok_or_else(|| Error::planning(&app.name, "no module name in File"))
}

/// A single shell word, quoted only when it has to be
fn quote(value: &str) -> String {
    escape(Cow::Borrowed(value)).into_owned()
}

fn quote_path(path: &Path) -> String {
    escape(path.to_string_lossy()).into_owned()
}
