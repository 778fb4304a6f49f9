// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[error("nix error: {0}")]
    NixError(#[from] nix::Error),
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    /// A declared application could not be registered
    #[error("invalid application {app:?}: {reason}")]
    Config { app: String, reason: String },
    /// The runtime and environment of an application can not be turned into a command
    #[error("could not resolve runtime for {app:?}: {reason}")]
    Planning { app: String, reason: String },
    /// The launch script could not be written or executed
    #[error("failed to launch {app:?}: {reason}")]
    Launch { app: String, reason: String },
    /// The launch went through, but no matching process showed up in time
    #[error("{app:?} did not start within expected time ({attempts} attempts)")]
    ConfirmationTimeout { app: String, attempts: u32 },
    #[error("start of {app:?} was cancelled")]
    Cancelled { app: String },
    /// Even the forced kill failed, the process is left as last observed
    #[error("failed to kill process {pid}: {source}")]
    StopEscalation { pid: u32, source: nix::Error },
    #[error("no application named {0:?}")]
    UnknownApp(String),
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// Advisory failures do not mean anything is wrong, a later refresh may still observe the process
    pub fn is_advisory(&self) -> bool {
        matches!(
            self.0,
            ErrorKind::ConfirmationTimeout { .. } | ErrorKind::Cancelled { .. }
        )
    }

    pub(crate) fn config(app: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::Config {
            app: app.into(),
            reason: reason.into(),
        })
    }

    pub(crate) fn planning(app: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::Planning {
            app: app.into(),
            reason: reason.into(),
        })
    }

    pub(crate) fn launch(app: impl Into<String>, reason: impl ToString) -> Self {
        Self::from_kind(ErrorKind::Launch {
            app: app.into(),
            reason: reason.to_string(),
        })
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::from_kind(ErrorKind::ErrorMsg(err))
    }
}
