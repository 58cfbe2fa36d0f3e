//! Installer error taxonomy and the first-error-wins accumulator.

use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

use crate::control::Controller;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    InitializationError,
    FileConstructionFail,
    OutOfDiskSpace,
    UserCanceled,
    BuildVerifyFail,
}

impl ErrorCategory {
    pub fn prefix(&self) -> &'static str {
        match self {
            ErrorCategory::InitializationError => "IN",
            ErrorCategory::FileConstructionFail => "FC",
            ErrorCategory::OutOfDiskSpace => "DS",
            ErrorCategory::UserCanceled => "UC",
            ErrorCategory::BuildVerifyFail => "BV",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MissingStageDirectory,
    StagingCleanFail,
    MissingFileInfo,
    InvalidPath,
    MissingChunkData,
    TrackingError,
    FileCreateFail,
    SymlinkCreateFail,
    OutboundCorrupt,
    WriteFail,
    UnknownFail,
    InitialSpace,
    DuringInstallation,
    UserRequested,
    FinalCheck,
}

impl ErrorCode {
    pub fn category(&self) -> ErrorCategory {
        use ErrorCode::*;
        match self {
            MissingStageDirectory | StagingCleanFail => ErrorCategory::InitializationError,
            MissingFileInfo | InvalidPath | MissingChunkData | TrackingError | FileCreateFail
            | SymlinkCreateFail | OutboundCorrupt | WriteFail | UnknownFail => {
                ErrorCategory::FileConstructionFail
            }
            InitialSpace | DuringInstallation => ErrorCategory::OutOfDiskSpace,
            UserRequested => ErrorCategory::UserCanceled,
            FinalCheck => ErrorCategory::BuildVerifyFail,
        }
    }

    fn number(&self) -> u8 {
        use ErrorCode::*;
        match self {
            MissingStageDirectory => 1,
            StagingCleanFail => 2,
            MissingFileInfo => 1,
            InvalidPath => 2,
            MissingChunkData => 3,
            TrackingError => 4,
            FileCreateFail => 5,
            SymlinkCreateFail => 6,
            OutboundCorrupt => 7,
            WriteFail => 8,
            UnknownFail => 9,
            InitialSpace => 1,
            DuringInstallation => 2,
            UserRequested => 1,
            FinalCheck => 1,
        }
    }

    /// Stable short form such as `FC-03`, used for localization keys and logs.
    pub fn short(&self) -> String {
        format!("{}-{:02}", self.category().prefix(), self.number())
    }

    /// Corruption-class failures whose partial output must not be resumed from.
    pub fn deletes_partial(&self) -> bool {
        matches!(self, ErrorCode::OutboundCorrupt | ErrorCode::WriteFail)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{category} [{}]: {message}", .code.short())]
pub struct InstallError {
    pub category: ErrorCategory,
    pub code: ErrorCode,
    pub message: String,
}

impl InstallError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { category: code.category(), code, message: message.into() }
    }
}

/// Collects installer errors. The first one wins; the rest stay in history.
///
/// When bound to a [`Controller`], recording the first error aborts it so that
/// every worker polling the controller stops at its next check point.
#[derive(Default)]
pub struct InstallerError {
    errors: Mutex<Vec<InstallError>>,
    controller: Option<Controller>,
}

impl InstallerError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound_to(controller: Controller) -> Self {
        Self { errors: Mutex::new(Vec::new()), controller: Some(controller) }
    }

    /// Records `err`. Returns true when it became the reported (first) error.
    pub fn set_error(&self, err: InstallError) -> bool {
        let first = {
            let mut errors = self.errors.lock().unwrap_or_else(|p| p.into_inner());
            errors.push(err);
            errors.len() == 1
        };
        if let Some(c) = &self.controller {
            c.abort();
        }
        first
    }

    pub fn has_error(&self) -> bool {
        !self.errors.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
    }

    pub fn first(&self) -> Option<InstallError> {
        self.errors.lock().unwrap_or_else(|p| p.into_inner()).first().cloned()
    }

    pub fn history(&self) -> Vec<InstallError> {
        self.errors.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.first().map(|e| e.category == ErrorCategory::UserCanceled).unwrap_or(false)
    }
}
