// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Supervisor wide settings, constructed once and shared by reference

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::fs;
use tracing::debug;

use crate::Error;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where generated launch scripts are written, one per application
    pub scripts_dir: PathBuf,
    /// Where application output is redirected, one file per application
    pub logs_dir: PathBuf,
    /// Shell hook sourced before `conda activate`
    pub conda_hook: PathBuf,
    pub local_url: Option<String>,
    pub lan_url: Option<String>,
    pub wan_url: Option<String>,
    /// Number of snapshots taken after a launch before giving up on confirmation
    pub start_attempts: u32,
    pub start_delay_ms: u64,
    /// How long a process gets to exit after SIGTERM before it is killed
    pub stop_timeout_ms: u64,
    pub stop_poll_ms: u64,
    /// How long an unconfirmed start is reported as `Starting`, zero disables it
    pub starting_grace_ms: u64,
    /// Query `nvidia-smi` for per process accelerator memory on each snapshot
    pub accelerator_usage: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("startup_scripts"),
            logs_dir: PathBuf::from("logs"),
            conda_hook: PathBuf::from("~/mambaforge/etc/profile.d/conda.sh"),
            local_url: Some("http://localhost".to_string()),
            lan_url: None,
            wan_url: None,
            start_attempts: 5,
            start_delay_ms: 250,
            stop_timeout_ms: 5_000,
            stop_poll_ms: 100,
            starting_grace_ms: 0,
            accelerator_usage: false,
        }
    }
}

impl Settings {
    /// Load settings from a yaml file, a missing file yields the defaults
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Make all paths absolute and create the scripts and logs directories
    ///
    /// Generated scripts reference the log file by absolute path, so this should be called before any launch.
    pub async fn prepare(mut self) -> Result<Self, Error> {
        let cwd = std::env::current_dir()?;
        let home = dirs::home_dir();

        self.scripts_dir = resolve(&self.scripts_dir, &cwd, home.as_deref());
        self.logs_dir = resolve(&self.logs_dir, &cwd, home.as_deref());
        self.conda_hook = resolve(&self.conda_hook, &cwd, home.as_deref());

        fs::create_dir_all(&self.scripts_dir).await?;
        fs::create_dir_all(&self.logs_dir).await?;

        Ok(self)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }

    pub fn starting_grace(&self) -> Duration {
        Duration::from_millis(self.starting_grace_ms)
    }

    /// The base URLs applications are reachable at, labelled
    pub fn base_urls(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("Local", self.local_url.as_deref()),
            ("LAN", self.lan_url.as_deref()),
            ("WAN", self.wan_url.as_deref()),
        ]
        .into_iter()
        .filter_map(|(label, url)| url.map(|url| (label, url)))
    }
}

fn resolve(path: &Path, cwd: &Path, home: Option<&Path>) -> PathBuf {
    if let (Ok(rest), Some(home)) = (path.strip_prefix("~"), home) {
        return home.join(rest);
    }

    if path.is_relative() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_mapping() {
        let settings = Settings::from_yaml("{}").unwrap();
        assert_eq!(settings.start_attempts, 5);
        assert_eq!(settings.start_delay(), Duration::from_millis(250));
        assert_eq!(settings.stop_timeout(), Duration::from_secs(5));
        assert_eq!(settings.starting_grace(), Duration::ZERO);
        assert_eq!(settings.scripts_dir, PathBuf::from("startup_scripts"));
    }

    #[test]
    fn partial_override() {
        let settings = Settings::from_yaml(
            "logs_dir: /var/log/apps\nlan_url: http://192.168.1.2\nstart_attempts: 9\n",
        )
        .unwrap();
        assert_eq!(settings.logs_dir, PathBuf::from("/var/log/apps"));
        assert_eq!(settings.start_attempts, 9);
        assert_eq!(settings.stop_poll_ms, 100);

        let urls: Vec<_> = settings.base_urls().collect();
        assert_eq!(
            urls,
            vec![("Local", "http://localhost"), ("LAN", "http://192.168.1.2")]
        );
    }

    #[test]
    fn resolve_paths() {
        let cwd = Path::new("/work");
        let home = Path::new("/home/me");
        assert_eq!(
            resolve(Path::new("~/conda.sh"), cwd, Some(home)),
            PathBuf::from("/home/me/conda.sh")
        );
        assert_eq!(
            resolve(Path::new("logs"), cwd, Some(home)),
            PathBuf::from("/work/logs")
        );
        assert_eq!(
            resolve(Path::new("/abs"), cwd, None),
            PathBuf::from("/abs")
        );
    }

    #[tokio::test]
    async fn load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path().join("nope.yml")).await.unwrap();
        assert_eq!(settings.start_attempts, 5);
    }

    #[tokio::test]
    async fn prepare_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            scripts_dir: dir.path().join("scripts"),
            logs_dir: dir.path().join("logs"),
            ..Settings::default()
        };

        let settings = settings.prepare().await.unwrap();
        assert!(settings.scripts_dir.is_dir());
        assert!(settings.logs_dir.is_dir());
        assert!(settings.conda_hook.is_absolute());
    }
}
