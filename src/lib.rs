// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Supervise a fixed set of locally declared applications
//!
//! The `Supervisor` finds out which of the applications in an `AppRegistry` are running, by matching
//! them against a snapshot of the process table, and starts or stops them on request.

pub mod app;
pub mod config;
mod error;
pub mod host;
pub mod procs;
pub mod registry;

pub use app::ApplicationRecord;
pub use config::Settings;
pub use error::{Error, ErrorKind};
pub use host::{Host, LocalHost};
pub use procs::{AppState, AppStatus, ProcessController, Stopped, Supervisor};
pub use registry::AppRegistry;
