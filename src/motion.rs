use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc, time::Duration};

use crate::control::RunControl;
use crate::error::{Result, SqcError};
use crate::instrument::{NeedleDrive, TableDrive};
use crate::interlock::SharedPosition;
use crate::types::{Axis, Position};
use crate::utils::poll_until;

const NEEDLE_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisLimits {
    pub minimum: f64,
    pub maximum: f64,
}

impl AxisLimits {
    pub fn contains(&self, value: f64) -> bool {
        (self.minimum..=self.maximum).contains(&value)
    }
}

/// Table travel range in micrometres
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TravelLimits {
    pub x: AxisLimits,
    pub y: AxisLimits,
    pub z: AxisLimits,
}

impl TravelLimits {
    pub fn axis(&self, axis: Axis) -> AxisLimits {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn check(&self, target: &Position) -> Result<()> {
        for axis in Axis::ALL {
            let limits = self.axis(axis);
            let value = target.axis(axis);
            if !limits.contains(value) {
                return Err(SqcError::TravelLimit(format!(
                    "{axis:?} = {value:.3} um outside [{:.3}, {:.3}]",
                    limits.minimum, limits.maximum
                )));
            }
        }
        Ok(())
    }
}

impl Default for TravelLimits {
    fn default() -> Self {
        Self {
            x: AxisLimits {
                minimum: 0.0,
                maximum: 1_000_000.0,
            },
            y: AxisLimits {
                minimum: 0.0,
                maximum: 1_000_000.0,
            },
            z: AxisLimits {
                minimum: 0.0,
                maximum: 25_000.0,
            },
        }
    }
}

/// Motion tuning, loaded from the `[motion]` configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    pub limits: TravelLimits,
    /// Decreasing Z approach steps in um; the last one repeats
    pub approach_steps: Vec<f64>,
    pub max_contact_steps: usize,
    pub approach_settle_ms: u64,
    pub move_timeout_s: f64,
    pub poll_interval_ms: u64,
    pub safe_z_offset: f64,
    pub recover_z_offset: f64,
    pub position_tolerance: f64,
    pub calibration_tolerance: f64,
    pub recontact_offsets: Vec<f64>,
    pub needles_up_position: f64,
    pub needles_down_position: f64,
    pub needles_timeout_s: f64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            limits: TravelLimits::default(),
            approach_steps: vec![20.0, 15.0, 10.0, 5.0],
            max_contact_steps: 12,
            approach_settle_ms: 250,
            move_timeout_s: 60.0,
            poll_interval_ms: 50,
            safe_z_offset: 250.0,
            recover_z_offset: 800.0,
            position_tolerance: 1.0,
            calibration_tolerance: 1.0,
            recontact_offsets: vec![0.0, 5.0, -5.0, 2.0, -2.0],
            needles_up_position: 1000.0,
            needles_down_position: 0.0,
            needles_timeout_s: 60.0,
        }
    }
}

impl MotionSettings {
    /// Total Z distance covered by the approach steps
    pub fn approach_distance(&self) -> f64 {
        self.approach_steps.iter().map(|s| s.abs()).sum()
    }

    /// X offset for the given recontact attempt, cycling through the configured offsets
    pub fn recontact_offset(&self, attempt: usize) -> f64 {
        if self.recontact_offsets.is_empty() {
            return 0.0;
        }
        self.recontact_offsets[attempt % self.recontact_offsets.len()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MotionState {
    Idle,
    Moving,
    Faulted,
}

/// Returns true if both positions agree within `threshold` on every axis
pub fn verify_position(reference: &Position, position: &Position, threshold: f64) -> bool {
    Axis::ALL
        .iter()
        .all(|&axis| (reference.axis(axis) - position.axis(axis)).abs() <= threshold.abs())
}

/// Probing table and needle manipulator
pub struct MotionController {
    table: Box<dyn TableDrive>,
    needles: Option<Box<dyn NeedleDrive>>,
    settings: MotionSettings,
    state: MotionState,
    faulted_axes: BTreeSet<Axis>,
    position: SharedPosition,
}

impl MotionController {
    pub fn new(table: Box<dyn TableDrive>, settings: MotionSettings) -> Self {
        Self {
            table,
            needles: None,
            settings,
            state: MotionState::Idle,
            faulted_axes: BTreeSet::new(),
            position: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_needles(mut self, needles: Box<dyn NeedleDrive>) -> Self {
        self.needles = Some(needles);
        self
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Last position read back from the table
    pub fn last_position(&self) -> Option<Position> {
        *self.position.read()
    }

    /// Handle on the published position for the live monitor
    pub fn shared_position(&self) -> SharedPosition {
        self.position.clone()
    }

    pub fn read_position(&mut self) -> Result<Position> {
        let position = self.table.read_position()?;
        *self.position.write() = Some(position);
        Ok(position)
    }

    fn ensure_ready(&mut self, axes: &[Axis]) -> Result<()> {
        if self.state != MotionState::Idle {
            return Err(SqcError::MotionBusy);
        }
        if self.table.is_moving()? {
            return Err(SqcError::MotionBusy);
        }
        for &axis in axes {
            if !self.table.is_calibrated(axis)? {
                return Err(SqcError::NotCalibrated(axis));
            }
        }
        Ok(())
    }

    fn wait_idle(&mut self, control: &mut RunControl, axes: &[Axis]) -> Result<()> {
        let timeout = Duration::from_secs_f64(self.settings.move_timeout_s);
        let interval = Duration::from_millis(self.settings.poll_interval_ms);
        let table = &mut self.table;
        let result = poll_until(
            || table.is_moving().map(|moving| !moving),
            timeout,
            interval,
            |d| control.wait(d),
        );
        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!("Table did not finish moving within {:.1} s", timeout.as_secs_f64());
                let _ = self.table.stop();
                self.state = MotionState::Faulted;
                self.faulted_axes.extend(axes.iter().copied());
                Err(SqcError::MotionTimeout(timeout.as_secs_f64()))
            }
            Err(err) => {
                let _ = self.table.stop();
                self.state = if err.is_aborted() {
                    MotionState::Idle
                } else {
                    self.faulted_axes.extend(axes.iter().copied());
                    MotionState::Faulted
                };
                Err(err)
            }
        }
    }

    /// Absolute move with limit, calibration and completion checks
    pub fn move_to(&mut self, target: Position, control: &mut RunControl) -> Result<Position> {
        self.ensure_ready(&Axis::ALL)?;
        self.settings.limits.check(&target)?;
        debug!("Table move absolute {target}");

        self.state = MotionState::Moving;
        if let Err(err) = self.table.move_absolute(target) {
            self.state = MotionState::Faulted;
            self.faulted_axes.extend(Axis::ALL);
            return Err(err);
        }
        self.wait_idle(control, &Axis::ALL)?;
        self.state = MotionState::Idle;
        self.read_position()
    }

    pub fn move_relative(&mut self, delta: Position, control: &mut RunControl) -> Result<Position> {
        let axes: Vec<Axis> = Axis::ALL
            .into_iter()
            .filter(|&axis| delta.axis(axis) != 0.0)
            .collect();
        if axes.is_empty() {
            return self.read_position();
        }
        self.ensure_ready(&axes)?;
        let current = self.read_position()?;
        let target = current.offset(delta.x, delta.y, delta.z);
        self.settings.limits.check(&target)?;
        debug!("Table move relative ({}, {}, {}) um", delta.x, delta.y, delta.z);

        self.state = MotionState::Moving;
        if let Err(err) = self.table.move_relative(delta) {
            self.state = MotionState::Faulted;
            self.faulted_axes.extend(axes.iter().copied());
            return Err(err);
        }
        self.wait_idle(control, &axes)?;
        self.state = MotionState::Idle;
        self.read_position()
    }

    /// Runs the calibration routine of one axis and verifies the read-back origin
    pub fn calibrate(&mut self, axis: Axis, control: &mut RunControl) -> Result<()> {
        if self.state == MotionState::Moving {
            return Err(SqcError::MotionBusy);
        }
        info!("Calibrating axis {axis:?}");
        let previous = self.state;
        self.state = MotionState::Moving;
        let (value, calibrated) = match self.run_calibration(axis, control) {
            Ok(origin) => origin,
            Err(err) => {
                if err.is_aborted() {
                    self.state = previous;
                } else {
                    self.state = MotionState::Faulted;
                    self.faulted_axes.insert(axis);
                }
                return Err(err);
            }
        };
        if !calibrated || value.abs() > self.settings.calibration_tolerance {
            self.state = MotionState::Faulted;
            self.faulted_axes.insert(axis);
            return Err(SqcError::CalibrationFailed {
                axis,
                position: value,
            });
        }

        self.faulted_axes.remove(&axis);
        self.state = if previous == MotionState::Faulted && !self.faulted_axes.is_empty() {
            MotionState::Faulted
        } else {
            MotionState::Idle
        };
        if previous == MotionState::Faulted && self.state == MotionState::Idle {
            info!("All faulted axes recalibrated, motion controller idle");
        }
        Ok(())
    }

    /// Read-back origin of `axis` after its calibration routine, and the drive's calibrated flag
    fn run_calibration(&mut self, axis: Axis, control: &mut RunControl) -> Result<(f64, bool)> {
        self.table.calibrate(axis)?;
        self.wait_idle(control, &[axis])?;
        let value = self.read_position()?.axis(axis);
        Ok((value, self.table.is_calibrated(axis)?))
    }

    /// Lowers Z by the safe offset, travels in XY, then moves Z to the target height
    pub fn safe_move_absolute(&mut self, target: Position, control: &mut RunControl) -> Result<Position> {
        self.settings.limits.check(&target)?;
        let current = self.read_position()?;
        let lift = (current.z - self.settings.safe_z_offset.abs()).max(self.settings.limits.z.minimum);
        if lift != current.z {
            self.move_to(current.with_axis(Axis::Z, lift), control)?;
        }
        self.move_to(Position::new(target.x, target.y, lift), control)?;
        self.move_to(target, control)
    }

    /// Retracts Z by the recover offset, clamped at the lower travel limit
    pub fn safe_recover(&mut self, control: &mut RunControl) -> Result<Position> {
        let current = self.read_position()?;
        let z = (current.z - self.settings.recover_z_offset.abs()).max(self.settings.limits.z.minimum);
        info!("Table recover to z = {z:.3} um");
        self.move_relative(Position::new(0.0, 0.0, z - current.z), control)
    }

    /// Moves below `target` by the total approach distance, then steps up with
    /// decreasing Z steps until `criterion` holds.
    pub fn approach_contact<F>(
        &mut self,
        target: Position,
        control: &mut RunControl,
        mut criterion: F,
    ) -> Result<Position>
    where
        F: FnMut(&Position) -> Result<bool>,
    {
        if self.settings.approach_steps.is_empty() {
            return Err(SqcError::Configuration(
                "approach_steps must not be empty".to_string(),
            ));
        }
        let start = target.with_axis(Axis::Z, target.z - self.settings.approach_distance());
        self.safe_move_absolute(start, control)?;

        let settle = Duration::from_millis(self.settings.approach_settle_ms);
        let last = self.settings.approach_steps.len() - 1;
        for i in 0..self.settings.max_contact_steps {
            let step = self.settings.approach_steps[i.min(last)].abs();
            control.wait(settle)?;
            let position = self.move_relative(Position::new(0.0, 0.0, step), control)?;
            if criterion(&position)? {
                debug!("Contact after {} approach steps at {position}", i + 1);
                return Ok(position);
            }
        }
        Err(SqcError::ContactNotFound {
            steps: self.settings.max_contact_steps,
        })
    }

    /// Contacts a strip pad: approach until the target height is reached, then verify the position
    pub fn contact(&mut self, target: Position, control: &mut RunControl) -> Result<Position> {
        let tolerance = self.settings.position_tolerance;
        let position = self.approach_contact(target, control, |p| Ok(p.z >= target.z - tolerance))?;
        if !verify_position(&target, &position, tolerance) {
            warn!("Table position mismatch, requested {target} but table returned {position}");
            return Err(SqcError::ContactNotFound {
                steps: self.settings.max_contact_steps,
            });
        }
        Ok(position)
    }

    /// Immediate stop; leaves the controller idle unless it already faulted
    pub fn stop(&mut self) -> Result<()> {
        self.table.stop()?;
        if self.state == MotionState::Moving {
            self.state = MotionState::Idle;
        }
        Ok(())
    }

    pub fn needles_up(&mut self) -> Result<()> {
        let position = self.settings.needles_up_position;
        self.move_needles(position, "up")
    }

    pub fn needles_down(&mut self) -> Result<()> {
        let position = self.settings.needles_down_position;
        self.move_needles(position, "down")
    }

    fn move_needles(&mut self, position: f64, label: &str) -> Result<()> {
        let timeout = Duration::from_secs_f64(self.settings.needles_timeout_s);
        let Some(needles) = self.needles.as_mut() else {
            debug!("No needle drive configured, ignoring needles {label}");
            return Ok(());
        };
        info!("Moving needles {label}...");
        needles.move_to(position)?;

        // Finished once the same position is read twice in a row
        let mut previous = needles.read_position()?;
        let settled = poll_until(
            || {
                let current = needles.read_position()?;
                let settled = current == previous;
                previous = current;
                Ok(settled)
            },
            timeout,
            Duration::from_millis(NEEDLE_POLL_INTERVAL_MS),
            crate::utils::sleep,
        )?;
        if !settled {
            return Err(SqcError::MotionTimeout(timeout.as_secs_f64()));
        }
        info!("Moving needles {label}... done.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimNeedles, SimTable};

    fn settings() -> MotionSettings {
        MotionSettings {
            approach_settle_ms: 0,
            move_timeout_s: 0.05,
            poll_interval_ms: 1,
            ..MotionSettings::default()
        }
    }

    fn controller(table: &SimTable) -> MotionController {
        MotionController::new(Box::new(table.clone()), settings())
    }

    #[test]
    fn test_move_publishes_position() {
        let table = SimTable::new();
        let mut motion = controller(&table);
        let (_handle, mut control) = RunControl::new();
        let target = Position::new(1000.0, 2000.0, 500.0);
        motion.move_to(target, &mut control).unwrap();
        assert_eq!(motion.last_position(), Some(target));
        assert_eq!(*motion.shared_position().read(), Some(target));
        assert_eq!(motion.state(), MotionState::Idle);
    }

    #[test]
    fn test_uncalibrated_axis_rejected() {
        let table = SimTable::uncalibrated();
        let mut motion = controller(&table);
        let (_handle, mut control) = RunControl::new();
        let result = motion.move_to(Position::new(10.0, 10.0, 10.0), &mut control);
        assert!(matches!(result, Err(SqcError::NotCalibrated(Axis::X))));
        assert!(table.moves().is_empty());
    }

    #[test]
    fn test_travel_limit() {
        let table = SimTable::new();
        let mut motion = controller(&table);
        let (_handle, mut control) = RunControl::new();
        let result = motion.move_to(Position::new(10.0, 10.0, 99_999.0), &mut control);
        assert!(matches!(result, Err(SqcError::TravelLimit(_))));
    }

    #[test]
    fn test_timeout_faults_until_recalibrated() {
        let table = SimTable::new();
        let mut motion = controller(&table);
        let (_handle, mut control) = RunControl::new();

        table.set_stuck(true);
        let result = motion.move_to(Position::new(10.0, 10.0, 10.0), &mut control);
        assert!(matches!(result, Err(SqcError::MotionTimeout(_))));
        assert_eq!(motion.state(), MotionState::Faulted);
        assert!(table.stops() >= 1);

        table.set_stuck(false);
        assert!(matches!(
            motion.move_to(Position::new(10.0, 10.0, 10.0), &mut control),
            Err(SqcError::MotionBusy)
        ));

        motion.calibrate(Axis::X, &mut control).unwrap();
        motion.calibrate(Axis::Y, &mut control).unwrap();
        assert_eq!(motion.state(), MotionState::Faulted);
        motion.calibrate(Axis::Z, &mut control).unwrap();
        assert_eq!(motion.state(), MotionState::Idle);
    }

    #[test]
    fn test_calibration_read_back_verified() {
        let table = SimTable::new();
        table.set_calibration_error(12.0);
        let mut motion = controller(&table);
        let (_handle, mut control) = RunControl::new();
        let result = motion.calibrate(Axis::Z, &mut control);
        assert!(matches!(
            result,
            Err(SqcError::CalibrationFailed { axis: Axis::Z, .. })
        ));
        assert_eq!(motion.state(), MotionState::Faulted);
    }

    /// Table whose calibration routine fails a number of times before delegating
    struct FlakyCalibration {
        table: SimTable,
        failures: usize,
    }

    impl TableDrive for FlakyCalibration {
        fn move_absolute(&mut self, position: Position) -> Result<()> {
            self.table.move_absolute(position)
        }

        fn move_relative(&mut self, delta: Position) -> Result<()> {
            self.table.move_relative(delta)
        }

        fn read_position(&mut self) -> Result<Position> {
            self.table.read_position()
        }

        fn is_moving(&mut self) -> Result<bool> {
            self.table.is_moving()
        }

        fn calibrate(&mut self, axis: Axis) -> Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(SqcError::Instrument("calibration routine rejected".to_string()));
            }
            self.table.calibrate(axis)
        }

        fn is_calibrated(&mut self, axis: Axis) -> Result<bool> {
            self.table.is_calibrated(axis)
        }

        fn stop(&mut self) -> Result<()> {
            self.table.stop()
        }
    }

    #[test]
    fn test_calibration_drive_error_faults_axis() {
        let table = SimTable::new();
        let flaky = FlakyCalibration {
            table: table.clone(),
            failures: 1,
        };
        let mut motion = MotionController::new(Box::new(flaky), settings());
        let (_handle, mut control) = RunControl::new();

        let result = motion.calibrate(Axis::Y, &mut control);
        assert!(matches!(result, Err(SqcError::Instrument(_))));
        assert_eq!(motion.state(), MotionState::Faulted);
        assert!(matches!(
            motion.move_to(Position::new(10.0, 10.0, 10.0), &mut control),
            Err(SqcError::MotionBusy)
        ));

        motion.calibrate(Axis::Y, &mut control).unwrap();
        assert_eq!(motion.state(), MotionState::Idle);
        motion.move_to(Position::new(10.0, 10.0, 10.0), &mut control).unwrap();
    }

    #[test]
    fn test_contact_approaches_with_decreasing_steps() {
        let table = SimTable::new();
        let mut motion = controller(&table);
        let (_handle, mut control) = RunControl::new();
        let target = Position::new(5000.0, 3000.0, 1200.0);

        let position = motion.contact(target, &mut control).unwrap();
        assert!(verify_position(&target, &position, 1.0));

        let z: Vec<f64> = table.moves().iter().map(|p| p.z).collect();
        let tail = &z[z.len() - 5..];
        assert_eq!(tail, &[1150.0, 1170.0, 1185.0, 1195.0, 1200.0]);
    }

    #[test]
    fn test_contact_not_found() {
        let table = SimTable::new();
        let mut motion = controller(&table);
        let (_handle, mut control) = RunControl::new();
        let target = Position::new(5000.0, 3000.0, 1200.0);
        let mut checks = 0;
        let result = motion.approach_contact(target, &mut control, |_| {
            checks += 1;
            Ok(false)
        });
        assert!(matches!(result, Err(SqcError::ContactNotFound { steps: 12 })));
        assert_eq!(checks, 12);
    }

    #[test]
    fn test_safe_recover_clamps_to_limit() {
        let table = SimTable::new();
        let mut motion = controller(&table);
        let (_handle, mut control) = RunControl::new();
        motion
            .move_to(Position::new(100.0, 100.0, 300.0), &mut control)
            .unwrap();
        let position = motion.safe_recover(&mut control).unwrap();
        assert_eq!(position.z, 0.0);
    }

    #[test]
    fn test_needles_up_and_down() {
        let needles = SimNeedles::new();
        let table = SimTable::new();
        let mut motion = controller(&table).with_needles(Box::new(needles.clone()));
        motion.needles_up().unwrap();
        assert_eq!(needles.position(), 1000.0);
        motion.needles_down().unwrap();
        assert_eq!(needles.moves(), vec![1000.0, 0.0]);
    }

    #[test]
    fn test_recontact_offsets_cycle() {
        let settings = MotionSettings::default();
        let offsets: Vec<f64> = (0..6).map(|i| settings.recontact_offset(i)).collect();
        assert_eq!(offsets, vec![0.0, 5.0, -5.0, 2.0, -2.0, 0.0]);
    }
}
