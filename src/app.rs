// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Declared applications, as read from the apps file

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::config::Settings;
use crate::Error;

pub const DEFAULT_CATEGORY: &str = "Uncategorized";

/// How the application is hosted, this decides both the launch command and how the process is recognized
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    /// Long running UI server, `streamlit run <file>`
    Streamlit,
    /// ASGI server, `uvicorn <module>:app`
    FastApi,
    /// WSGI server, `gunicorn <module>:app`
    Flask,
    /// Plain interpreted script
    Python,
}

impl RuntimeKind {
    pub fn requires_port(self) -> bool {
        !matches!(self, RuntimeKind::Python)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Streamlit => "streamlit",
            RuntimeKind::FastApi => "fastapi",
            RuntimeKind::Flask => "flask",
            RuntimeKind::Python => "python",
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "streamlit" => Ok(RuntimeKind::Streamlit),
            "fastapi" => Ok(RuntimeKind::FastApi),
            "flask" => Ok(RuntimeKind::Flask),
            "python" => Ok(RuntimeKind::Python),
            other => Err(format!("unknown Type: {}", other)),
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The environment an application runs in
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EnvironmentKind {
    /// A named conda environment
    Conda(String),
    /// A virtual environment, given by the path of its activation script
    Venv(PathBuf),
}

impl EnvironmentKind {
    fn parse(kind: &str, identifier: String) -> Result<Self, String> {
        match kind.to_ascii_lowercase().as_str() {
            "conda" => Ok(EnvironmentKind::Conda(identifier)),
            "venv" => Ok(EnvironmentKind::Venv(PathBuf::from(identifier))),
            other => Err(format!("unknown EnvironmentType: {}", other)),
        }
    }
}

/// An application entry exactly as it appears in the apps file
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppEntry {
    pub file: String,
    #[serde(default)]
    pub port: Option<i64>,
    pub environment: String,
    #[serde(default)]
    pub environment_type: Option<String>,
    #[serde(default, rename = "Type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub flags: Option<Vec<String>>,
    #[serde(default)]
    pub environment_variables: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default, rename = "PublicURL")]
    pub public_url: Option<String>,
}

/// A validated application, never mutated after it was loaded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationRecord {
    pub name: String,
    pub file: PathBuf,
    pub port: Option<u16>,
    pub runtime: RuntimeKind,
    pub environment: EnvironmentKind,
    pub working_directory: Option<PathBuf>,
    pub flags: Vec<String>,
    /// Sorted by name so that generated scripts are stable
    pub env_vars: BTreeMap<String, String>,
    pub category: String,
    pub public_url: Option<String>,
}

impl ApplicationRecord {
    /// Validate a raw entry into a record
    pub fn from_entry(name: &str, entry: AppEntry) -> Result<Self, Error> {
        let invalid = |reason: String| Error::config(name, reason);

        if name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if name.contains('/') {
            return Err(invalid("name must not contain '/'".to_string()));
        }
        if entry.file.trim().is_empty() {
            return Err(invalid("File must not be empty".to_string()));
        }
        if entry.environment.trim().is_empty() {
            return Err(invalid("Environment must not be empty".to_string()));
        }

        let runtime = match entry.kind.as_deref() {
            Some(kind) => kind.parse::<RuntimeKind>().map_err(invalid)?,
            None => RuntimeKind::Streamlit,
        };
        let environment = EnvironmentKind::parse(
            entry.environment_type.as_deref().unwrap_or("conda"),
            entry.environment,
        )
        .map_err(invalid)?;

        let port = match entry.port {
            Some(port) if port > 0 && port <= i64::from(u16::MAX) => Some(port as u16),
            Some(port) => return Err(invalid(format!("Port {} is out of range", port))),
            None if runtime.requires_port() => {
                return Err(invalid(format!("Port is required for {}", runtime)))
            }
            None => None,
        };

        let env_vars = entry.environment_variables.unwrap_or_default();
        if let Some(key) = env_vars.keys().find(|key| !is_variable_name(key)) {
            return Err(invalid(format!(
                "EnvironmentVariables key {:?} is not a valid variable name",
                key
            )));
        }

        // relative paths are taken from the working directory, or the current one
        let absolute = |path: PathBuf| -> Result<PathBuf, Error> {
            if path.is_absolute() {
                return Ok(path);
            }
            std::env::current_dir()
                .map(|cwd| cwd.join(&path))
                .map_err(|e| invalid(format!("can not resolve {}: {}", path.display(), e)))
        };
        let working_directory = entry
            .working_directory
            .map(|dir| absolute(PathBuf::from(dir)))
            .transpose()?;
        let file = match working_directory {
            Some(ref dir) => dir.join(entry.file),
            None => absolute(PathBuf::from(entry.file))?,
        };

        Ok(Self {
            name: name.to_string(),
            file,
            port,
            runtime,
            environment,
            working_directory,
            flags: entry.flags.unwrap_or_default(),
            env_vars,
            category: entry
                .category
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            public_url: entry.public_url,
        })
    }

    /// The directory the application is started from
    pub fn working_directory(&self) -> &Path {
        match self.working_directory {
            Some(ref dir) => dir,
            None => match self.file.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            },
        }
    }

    /// File name of the application's entry point, `app.py` for `/x/app.py`
    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Name used for the generated script and log files
    pub fn file_stem(&self) -> String {
        self.name.replace(' ', "_")
    }

    /// Everywhere the application should be reachable
    pub fn links(&self, settings: &Settings) -> Vec<Link> {
        let mut links = Vec::new();

        if let Some(port) = self.port {
            links.extend(settings.base_urls().map(|(label, base)| Link {
                label: label.to_string(),
                url: format!("{}:{}", base.trim_end_matches('/'), port),
            }));
        }

        if let Some(ref url) = self.public_url {
            links.push(Link {
                label: "Public".to_string(),
                url: url.clone(),
            });
        }

        links
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_variable_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub label: String,
    pub url: String,
}
