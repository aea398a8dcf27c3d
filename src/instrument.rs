use std::collections::BTreeSet;

use crate::error::SqcError;
use crate::types::{Axis, Channel, EnvironmentReading, Position};

/// Voltage source with current readback (bias supply or low-voltage SMU)
///
/// All values are SI base units: volts and amperes.
///
/// # Design Philosophy
/// - Only the commands the sequencer needs, no driver detail
/// - Implementations map these onto SCPI, TSP or vendor protocols
/// - Enables testing through simulated implementations
pub trait SourceMeter: Send {
    // === Output ===

    /// Enable or disable the source output
    fn set_output(&mut self, enabled: bool) -> Result<(), SqcError>;

    /// Whether the output is currently enabled
    fn output(&mut self) -> Result<bool, SqcError>;

    // === Source ===

    /// Program the source voltage
    ///
    /// # Arguments
    /// * `voltage` - Target level in volts
    fn set_voltage(&mut self, voltage: f64) -> Result<(), SqcError>;

    /// Currently programmed source voltage in volts
    fn voltage_level(&mut self) -> Result<f64, SqcError>;

    /// Program the hardware current compliance in amperes
    fn set_current_compliance(&mut self, compliance: f64) -> Result<(), SqcError>;

    /// Whether the hardware compliance limit has been hit
    fn compliance_tripped(&mut self) -> Result<bool, SqcError>;

    // === Measure ===

    /// Read the measured current in amperes
    fn read_current(&mut self) -> Result<f64, SqcError>;

    /// Read the measured voltage in volts
    fn read_voltage(&mut self) -> Result<f64, SqcError>;
}

/// Picoammeter used for strip currents
pub trait Electrometer: Send {
    /// Toggle the input zero check; must be disabled before reading
    fn set_zero_check(&mut self, enabled: bool) -> Result<(), SqcError>;

    /// Read a current in amperes
    fn read_current(&mut self) -> Result<f64, SqcError>;
}

/// Capacitance bridge
pub trait LcrMeter: Send {
    /// Acquire a single parallel-mode reading
    ///
    /// # Arguments
    /// * `amplitude` - AC amplitude in volts
    /// * `frequency` - AC frequency in hertz
    ///
    /// # Returns
    /// `(cp, rp)`: parallel capacitance in farads and parallel resistance in ohms
    fn read_lcr(&mut self, amplitude: f64, frequency: f64) -> Result<(f64, f64), SqcError>;
}

/// HV or LV switching matrix
pub trait SwitchMatrix: Send {
    /// Currently closed channels, as reported by the hardware
    fn closed_channels(&mut self) -> Result<BTreeSet<Channel>, SqcError>;

    /// Open the given channels
    fn open_channels(&mut self, channels: &BTreeSet<Channel>) -> Result<(), SqcError>;

    /// Close the given channels
    fn close_channels(&mut self, channels: &BTreeSet<Channel>) -> Result<(), SqcError>;

    /// Open every channel of the matrix
    fn open_all(&mut self) -> Result<(), SqcError>;
}

/// Climate controlled enclosure around the probe station
pub trait EnvironmentBox: Send {
    /// Snapshot of chuck temperature, box humidity and the test-running flag
    fn read_environment(&mut self) -> Result<EnvironmentReading, SqcError>;

    /// Signal to the enclosure that a test is in progress
    fn set_test_running(&mut self, running: bool) -> Result<(), SqcError>;
}

/// Three axis probing table, positions in micrometres
pub trait TableDrive: Send {
    /// Start an absolute move; completion is observed via [`TableDrive::is_moving`]
    fn move_absolute(&mut self, position: Position) -> Result<(), SqcError>;

    /// Start a relative move
    fn move_relative(&mut self, delta: Position) -> Result<(), SqcError>;

    /// Current table position
    fn read_position(&mut self) -> Result<Position, SqcError>;

    /// True while a move is still in progress
    fn is_moving(&mut self) -> Result<bool, SqcError>;

    /// Run the calibration (end switch) routine of one axis
    fn calibrate(&mut self, axis: Axis) -> Result<(), SqcError>;

    /// Whether the hardware reports the axis as calibrated
    fn is_calibrated(&mut self, axis: Axis) -> Result<bool, SqcError>;

    /// Stop any motion immediately
    fn stop(&mut self) -> Result<(), SqcError>;
}

/// Needle manipulator used to lift the second probe needle
pub trait NeedleDrive: Send {
    /// Start a move to an absolute needle position
    fn move_to(&mut self, position: f64) -> Result<(), SqcError>;

    /// Current needle position
    fn read_position(&mut self) -> Result<f64, SqcError>;
}
