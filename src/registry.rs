// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::app::{AppEntry, ApplicationRecord};
use crate::Error;

/// The applications declared for this session
///
/// Order is the order of declaration, it decides which application claims a process when more than one could.
#[derive(Clone, Debug, Default)]
pub struct AppRegistry {
    apps: Vec<ApplicationRecord>,
}

impl AppRegistry {
    /// Fails if two records share a name
    pub fn new(apps: Vec<ApplicationRecord>) -> Result<Self, Error> {
        let mut seen = HashSet::new();
        for app in &apps {
            if !seen.insert(app.name.as_str()) {
                return Err(Error::config(&app.name, "duplicate application name"));
            }
        }

        Ok(Self { apps })
    }

    /// Read the apps file, see `from_yaml`
    pub async fn load(path: impl AsRef<Path>) -> Result<(Self, Vec<Error>), Error> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml(&contents)
    }

    /// Parse a mapping of application name to entry
    ///
    /// A broken entry only drops that application; its error is returned next to the registry of the others.
    pub fn from_yaml(contents: &str) -> Result<(Self, Vec<Error>), Error> {
        let document: Option<Mapping> = if contents.trim().is_empty() {
            None
        } else {
            serde_yaml::from_str(contents)?
        };

        let mut apps = Vec::new();
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();

        for (key, value) in document.unwrap_or_default() {
            let name = match key {
                Value::String(name) => name,
                other => {
                    rejected.push(Error::config(
                        format!("{:?}", other),
                        "application names must be strings",
                    ));
                    continue;
                }
            };

            let record = serde_yaml::from_value::<AppEntry>(value)
                .map_err(|e| Error::config(&name, e.to_string()))
                .and_then(|entry| ApplicationRecord::from_entry(&name, entry));

            match record {
                Ok(_) if !seen.insert(name.clone()) => {
                    rejected.push(Error::config(&name, "duplicate application name"))
                }
                Ok(app) => apps.push(app),
                Err(e) => {
                    warn!(app = %name, error = %e, "skipping application");
                    rejected.push(e);
                }
            }
        }

        Ok((Self { apps }, rejected))
    }

    pub fn get(&self, name: &str) -> Option<&ApplicationRecord> {
        self.apps.iter().find(|app| app.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApplicationRecord> {
        self.apps.iter()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Applications grouped by category, categories sorted by name
    pub fn by_category(&self) -> BTreeMap<&str, Vec<&ApplicationRecord>> {
        let mut groups: BTreeMap<&str, Vec<&ApplicationRecord>> = BTreeMap::new();
        for app in &self.apps {
            groups.entry(app.category.as_str()).or_default().push(app);
        }
        groups
    }
}
