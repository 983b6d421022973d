// Licensed under the MIT License.

//! Error and result related types.

use crate::spec;
use std::error::Error;

/// An NVMe error, consisting of a status code and optional error source.
///
/// These never escape the controller; they are materialised as completion
/// entries by the command engine.
#[derive(Debug)]
pub struct NvmeError {
    status: spec::Status,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl NvmeError {
    pub fn new(status: spec::Status, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self {
            status,
            source: Some(source.into()),
        }
    }

    pub fn status(&self) -> spec::Status {
        self.status
    }
}

impl Error for NvmeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|x| x.as_ref() as _)
    }
}

impl std::fmt::Display for NvmeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status.status_code_type() {
            spec::StatusCodeType::GENERIC => {
                write!(f, "general error {:#x?}", self.status)
            }
            spec::StatusCodeType::COMMAND_SPECIFIC => {
                write!(f, "command-specific error {:#x?}", self.status)
            }
            _ => write!(f, "{:#x?}", self.status),
        }
    }
}

impl From<spec::Status> for NvmeError {
    fn from(status: spec::Status) -> Self {
        NvmeError {
            status,
            source: None,
        }
    }
}

/// The result of an NVMe command, as posted in its completion entry.
#[derive(Debug, Default)]
pub struct CommandResult {
    pub status: spec::Status,
    pub dnr: bool,
    pub dw: [u32; 2],
}

impl<T: Into<NvmeError>> From<T> for CommandResult {
    fn from(status: T) -> Self {
        let status = status.into().status();
        Self {
            status,
            // Nothing the simulator fails is worth the host retrying.
            dnr: status != spec::Status::SUCCESS,
            dw: [0; 2],
        }
    }
}
