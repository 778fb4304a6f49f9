// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod controller;
mod launcher;
pub mod matcher;
mod snapshot;
mod supervisor;

pub use controller::{ProcessController, Stopped};
pub use launcher::{LaunchArtifact, LaunchPlanner};
pub use matcher::{match_app, MatchResult};
pub use snapshot::{MemoryUsage, ProcessRecord, ProcessSnapshot};
pub use supervisor::{AppState, AppStatus, OpHandle, Supervisor};
