use serde::Serialize;
use thiserror::Error;

use crate::types::{Axis, Channel, Role};

pub type Result<T> = std::result::Result<T, SqcError>;

#[derive(Error, Debug)]
pub enum SqcError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Routing conflict on channel {channel}: requested by {first} and {second}")]
    RoutingConflict {
        channel: Channel,
        first: Role,
        second: Role,
    },
    #[error("Compliance tripped at {voltage} V (I = {current:e} A)")]
    ComplianceTripped { voltage: f64, current: f64 },
    #[error("Environment out of bounds for {waited_secs:.1} s: {reason}")]
    EnvironmentTimeout { waited_secs: f64, reason: String },
    #[error("Axis {0:?} is not calibrated")]
    NotCalibrated(Axis),
    #[error("Calibration of axis {axis:?} failed: read back {position} um")]
    CalibrationFailed { axis: Axis, position: f64 },
    #[error("No contact found after {steps} approach steps")]
    ContactNotFound { steps: usize },
    #[error("Motion did not finish within {0:.1} s")]
    MotionTimeout(f64),
    #[error("Motion controller busy or faulted")]
    MotionBusy,
    #[error("Travel limit exceeded: {0}")]
    TravelLimit(String),
    #[error("Invalid ramp parameters: {0}")]
    InvalidRampParameters(String),
    #[error("Value out of range: {0}")]
    ToleranceOutOfRange(String),
    #[error("Unit mismatch: {0}")]
    UnitMismatch(String),
    #[error("Run aborted")]
    Aborted,
    #[error("Another run is active on this setup")]
    RigBusy,
    #[error("Instrument error: {0}")]
    Instrument(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure classification attached to node reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    ConfigurationError,
    RoutingConflict,
    ComplianceTripped,
    EnvironmentTimeout,
    NotCalibrated,
    CalibrationFailed,
    ContactNotFound,
    MotionTimeout,
    MotionBusy,
    TravelLimit,
    InvalidRampParameters,
    ToleranceOutOfRange,
    Aborted,
    InstrumentError,
}

impl FailureKind {
    /// Failures after which no further node can be positioned safely
    pub fn escalates_to_abort(self) -> bool {
        matches!(
            self,
            FailureKind::NotCalibrated
                | FailureKind::CalibrationFailed
                | FailureKind::ContactNotFound
                | FailureKind::MotionTimeout
                | FailureKind::MotionBusy
                | FailureKind::TravelLimit
        )
    }
}

impl SqcError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SqcError::Configuration(_) | SqcError::UnitMismatch(_) => {
                FailureKind::ConfigurationError
            }
            SqcError::RoutingConflict { .. } => FailureKind::RoutingConflict,
            SqcError::ComplianceTripped { .. } => FailureKind::ComplianceTripped,
            SqcError::EnvironmentTimeout { .. } => FailureKind::EnvironmentTimeout,
            SqcError::NotCalibrated(_) => FailureKind::NotCalibrated,
            SqcError::CalibrationFailed { .. } => FailureKind::CalibrationFailed,
            SqcError::ContactNotFound { .. } => FailureKind::ContactNotFound,
            SqcError::MotionTimeout(_) => FailureKind::MotionTimeout,
            SqcError::MotionBusy => FailureKind::MotionBusy,
            SqcError::TravelLimit(_) => FailureKind::TravelLimit,
            SqcError::InvalidRampParameters(_) => FailureKind::InvalidRampParameters,
            SqcError::ToleranceOutOfRange(_) => FailureKind::ToleranceOutOfRange,
            SqcError::Aborted => FailureKind::Aborted,
            SqcError::RigBusy
            | SqcError::Instrument(_)
            | SqcError::Io(_)
            | SqcError::Json(_) => FailureKind::InstrumentError,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, SqcError::Aborted)
    }
}
