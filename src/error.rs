use std::time::Duration;

use thiserror::Error;

use crate::types::{Position, StageAxis};

/// Errors raised by the command channel and the motion controller.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Transport error ({context}): {source}")]
    Transport {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Controller not in standard mode: expected {expected:?}, got {actual:?}")]
    Initialization { expected: String, actual: String },
    #[error("Setting {parameter} on axis {axis} failed: `{command}` answered {response:?}")]
    Configuration {
        axis: StageAxis,
        parameter: &'static str,
        command: String,
        response: String,
    },
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Stage move to ({target}) timed out after {elapsed:?}")]
    MotionTimeout { target: Position, elapsed: Duration },
    #[error("Stage is in a fault state: {0}")]
    MotionFault(String),
    #[error("Joystick command `{command}` not acknowledged (got {response:?})")]
    Joystick { command: String, response: String },
}

impl StageError {
    /// Wrap an I/O failure with the operation that caused it.
    pub fn transport(source: std::io::Error, context: impl Into<String>) -> Self {
        StageError::Transport {
            source,
            context: context.into(),
        }
    }

    /// Only joystick interlock failures leave the run in a usable state; an
    /// operator can take over the stage by hand.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StageError::Joystick { .. })
    }
}

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Camera not ready: {0}")]
    NotReady(String),
    #[error("Capture failed: {0}")]
    Capture(String),
}

/// Failure of a single trigger invocation.
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("Invalid trigger: {0}")]
    Invalid(String),
}

impl TriggerError {
    /// A trigger that broke the stage link cannot be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TriggerError::Stage(e) if !e.is_recoverable())
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Could not create folder {path}: {source}")]
    Folder {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not write image {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Problems reading or validating the experiment parameter files.
#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Could not read {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed JSON in {path}: {source}")]
    Json {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid experiment: {0}")]
    Invalid(String),
}

/// Errors that end an acquisition run.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("Position {slot}: trigger '{trigger}' failed {attempts} rounds in a row: {source}")]
    TriggerRetriesExhausted {
        slot: usize,
        trigger: String,
        attempts: u32,
        #[source]
        source: TriggerError,
    },
    #[error("Position {slot}: trigger '{trigger}' failed: {source}")]
    Trigger {
        slot: usize,
        trigger: String,
        #[source]
        source: TriggerError,
    },
    #[error("Trigger initialization failed: {0}")]
    TriggerSetup(#[source] TriggerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Configuration error: {0}")]
    Config(String),
}
