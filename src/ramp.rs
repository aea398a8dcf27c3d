use log::{debug, info, warn};
use std::time::Duration;

use crate::control::RunControl;
use crate::error::{Result, SqcError};
use crate::instrument::SourceMeter;
use crate::units::{Quantity, Unit, format_metric};

/// Step used when returning a source to zero outside of a configured ramp
pub const DEFAULT_RECOVER_STEP_V: f64 = 10.0;
const RECOVER_SETTLE_TIME_MS: u64 = 250;
/// Upper bound on the set points of one ramp
pub const MAX_RAMP_STEPS: usize = 10_000;

/// Parameters of one voltage ramp
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampSpec {
    pub begin: Quantity,
    pub end: Quantity,
    pub step: Quantity,
    pub waiting_time: Quantity,
    /// Software current limit, compared against `|I|` after every step
    pub compliance: Option<Quantity>,
}

impl RampSpec {
    /// Validates units and step direction, returning the intermediate set points (begin excluded)
    pub fn points(&self) -> Result<Vec<f64>> {
        let units_ok = self.begin.unit() == Unit::Volt
            && self.end.unit() == Unit::Volt
            && self.step.unit() == Unit::Volt
            && self.waiting_time.unit() == Unit::Second
            && self.compliance.is_none_or(|c| c.unit() == Unit::Ampere);
        if !units_ok {
            return Err(SqcError::InvalidRampParameters(format!(
                "unexpected units in ramp {} -> {} step {}",
                self.begin, self.end, self.step
            )));
        }

        let begin = self.begin.value();
        let end = self.end.value();
        let step = self.step.value();
        let distance = end - begin;
        if distance == 0.0 {
            return Ok(Vec::new());
        }
        if step == 0.0 || !step.is_finite() {
            return Err(SqcError::InvalidRampParameters(
                "step must be non-zero".to_string(),
            ));
        }
        if step.signum() != distance.signum() {
            return Err(SqcError::InvalidRampParameters(format!(
                "step {} does not lead from {} to {}",
                self.step, self.begin, self.end
            )));
        }
        if self.waiting_time.value() < 0.0 {
            return Err(SqcError::InvalidRampParameters(
                "waiting time must not be negative".to_string(),
            ));
        }

        let steps = ((distance / step) - 1e-9).ceil().max(1.0);
        if steps > MAX_RAMP_STEPS as f64 {
            return Err(SqcError::InvalidRampParameters(format!(
                "{steps} steps from {} to {} exceed the limit of {MAX_RAMP_STEPS}",
                self.begin, self.end
            )));
        }
        let count = steps as usize;
        Ok((1..=count)
            .map(|i| {
                if i == count {
                    end
                } else {
                    begin + i as f64 * step
                }
            })
            .collect())
    }
}

/// Set point reached by the ramp, handed to the per-step callback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampStep {
    pub index: usize,
    pub count: usize,
    pub voltage: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RampReport {
    pub points: Vec<f64>,
    pub waits: usize,
}

/// Drives a [`SourceMeter`] through voltage ramps with compliance supervision
#[derive(Debug, Clone)]
pub struct RampEngine {
    recover_settle: Duration,
}

impl Default for RampEngine {
    fn default() -> Self {
        Self {
            recover_settle: Duration::from_millis(RECOVER_SETTLE_TIME_MS),
        }
    }
}

impl RampEngine {
    pub fn new(recover_settle: Duration) -> Self {
        Self { recover_settle }
    }

    /// Ramps from `spec.begin` to `spec.end`.
    ///
    /// After every step the engine waits `waiting_time` (cancellable), calls
    /// `on_step` and checks compliance. On a trip, an abort, or any error the
    /// source is returned to zero in steps of `|spec.step|` before the error is
    /// propagated.
    pub fn ramp<F>(
        &self,
        source: &mut dyn SourceMeter,
        spec: &RampSpec,
        control: &mut RunControl,
        mut on_step: F,
    ) -> Result<RampReport>
    where
        F: FnMut(&mut dyn SourceMeter, &mut RunControl, RampStep) -> Result<()>,
    {
        let points = spec.points()?;
        let count = points.len();
        let wait = Duration::from_secs_f64(spec.waiting_time.value());
        debug!(
            "Ramp {} -> {} in {} steps",
            spec.begin, spec.end, count
        );

        let mut report = RampReport {
            points: Vec::with_capacity(count),
            waits: 0,
        };

        for (index, &voltage) in points.iter().enumerate() {
            let result = (|| -> Result<()> {
                control.check_point()?;
                source.set_voltage(voltage)?;
                report.points.push(voltage);
                control.wait(wait)?;
                report.waits += 1;
                on_step(
                    &mut *source,
                    &mut *control,
                    RampStep {
                        index,
                        count,
                        voltage,
                    },
                )?;
                check_compliance(&mut *source, voltage, spec.compliance)
            })();

            if let Err(err) = result {
                match &err {
                    SqcError::ComplianceTripped { .. } => {
                        warn!("{err}, returning to zero");
                    }
                    SqcError::Aborted => info!("Ramp aborted at {}", format_metric(voltage, Unit::Volt)),
                    other => warn!("Ramp interrupted at {}: {other}", format_metric(voltage, Unit::Volt)),
                }
                if let Err(recover_err) = self.recover(source, spec.step.value().abs()) {
                    warn!("Failed to return source to zero: {recover_err}");
                }
                return Err(err);
            }
        }

        Ok(report)
    }

    /// Returns the source to 0 V in steps of `step` without honoring abort
    pub fn recover(&self, source: &mut dyn SourceMeter, step: f64) -> Result<()> {
        let step = if step > 0.0 && step.is_finite() {
            step
        } else {
            DEFAULT_RECOVER_STEP_V
        };
        let start = source.voltage_level()?;
        if start == 0.0 {
            return Ok(());
        }
        let count = ((start.abs() / step) - 1e-9).ceil().max(1.0) as usize;
        debug!(
            "Recover {} -> 0 V in {} steps",
            format_metric(start, Unit::Volt),
            count
        );
        for i in 1..=count {
            let voltage = if i == count {
                0.0
            } else {
                start - start.signum() * step * i as f64
            };
            source.set_voltage(voltage)?;
            if i < count && !self.recover_settle.is_zero() {
                std::thread::sleep(self.recover_settle);
            }
        }
        Ok(())
    }

    /// Normal ramp-down to zero with the default step
    pub fn ramp_to_zero(&self, source: &mut dyn SourceMeter) -> Result<()> {
        self.recover(source, DEFAULT_RECOVER_STEP_V)
    }
}

/// Fails with `ComplianceTripped` on a hardware trip or when `|I|` reaches the software limit
pub fn check_compliance(
    source: &mut dyn SourceMeter,
    voltage: f64,
    compliance: Option<Quantity>,
) -> Result<()> {
    if source.compliance_tripped()? {
        let current = source.read_current()?;
        return Err(SqcError::ComplianceTripped { voltage, current });
    }
    if let Some(limit) = compliance {
        let current = source.read_current()?;
        if current.abs() >= limit.value().abs() {
            return Err(SqcError::ComplianceTripped { voltage, current });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimSourceMeter;
    use std::time::Instant;

    fn spec(begin: f64, end: f64, step: f64) -> RampSpec {
        RampSpec {
            begin: Quantity::volts(begin),
            end: Quantity::volts(end),
            step: Quantity::volts(step),
            waiting_time: Quantity::seconds(0.002),
            compliance: Some(Quantity::amperes(1e-3)),
        }
    }

    fn engine() -> RampEngine {
        RampEngine::new(Duration::ZERO)
    }

    #[test]
    fn test_ramp_ten_steps_with_waits() {
        let sim = SimSourceMeter::new(1e9);
        let mut source = sim.clone();
        source.set_output(true).unwrap();
        let (_handle, mut control) = RunControl::new();

        let mut seen = Vec::new();
        let start = Instant::now();
        let report = engine()
            .ramp(&mut source, &spec(0.0, -100.0, -10.0), &mut control, |_, _, step| {
                seen.push(step.voltage);
                Ok(())
            })
            .unwrap();

        assert_eq!(report.points.len(), 10);
        assert_eq!(report.waits, 10);
        assert_eq!(*report.points.last().unwrap(), -100.0);
        assert_eq!(seen, report.points);
        assert_eq!(sim.history(), report.points);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_last_step_snaps_to_end() {
        let points = spec(0.0, 25.0, 10.0).points().unwrap();
        assert_eq!(points, vec![10.0, 20.0, 25.0]);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            spec(0.0, -100.0, 10.0).points(),
            Err(SqcError::InvalidRampParameters(_))
        ));
        assert!(matches!(
            spec(0.0, -100.0, 0.0).points(),
            Err(SqcError::InvalidRampParameters(_))
        ));
        let mut bad_units = spec(0.0, -100.0, -10.0);
        bad_units.step = Quantity::amperes(-10.0);
        assert!(matches!(
            bad_units.points(),
            Err(SqcError::InvalidRampParameters(_))
        ));
        assert!(spec(5.0, 5.0, 1.0).points().unwrap().is_empty());
    }

    #[test]
    fn test_step_count_is_bounded() {
        assert!(matches!(
            spec(0.0, -600.0, -1e-6).points(),
            Err(SqcError::InvalidRampParameters(_))
        ));
        assert_eq!(spec(0.0, -600.0, -0.1).points().unwrap().len(), 6_000);
    }

    #[test]
    fn test_compliance_trip_returns_to_zero() {
        let sim = SimSourceMeter::new(1e9).trip_at(-200.0);
        let mut source = sim.clone();
        source.set_output(true).unwrap();
        let (_handle, mut control) = RunControl::new();

        let mut s = spec(0.0, -400.0, -5.0);
        s.waiting_time = Quantity::seconds(0.0);
        let result = engine().ramp(&mut source, &s, &mut control, |_, _, _| Ok(()));

        assert!(matches!(
            result,
            Err(SqcError::ComplianceTripped { voltage, .. }) if voltage == -200.0
        ));
        let history = sim.history();
        let trip = history.iter().position(|v| *v == -200.0).unwrap();
        assert_eq!(trip, 39);
        let descent = &history[trip + 1..];
        assert_eq!(descent.len(), 40);
        assert!(descent.windows(2).all(|w| (w[1] - w[0] - 5.0).abs() < 1e-9));
        assert_eq!(*descent.last().unwrap(), 0.0);
    }

    #[test]
    fn test_software_compliance() {
        let sim = SimSourceMeter::new(1e6);
        let mut source = sim.clone();
        source.set_output(true).unwrap();
        let (_handle, mut control) = RunControl::new();

        let mut s = spec(0.0, -100.0, -10.0);
        s.compliance = Some(Quantity::amperes(25e-6));
        let result = engine().ramp(&mut source, &s, &mut control, |_, _, _| Ok(()));
        assert!(matches!(
            result,
            Err(SqcError::ComplianceTripped { voltage, .. }) if voltage == -30.0
        ));
        assert_eq!(sim.voltage(), 0.0);
    }

    #[test]
    fn test_abort_during_ramp_recovers() {
        let sim = SimSourceMeter::new(1e9);
        let mut source = sim.clone();
        let (handle, mut control) = RunControl::new();

        let result = engine().ramp(
            &mut source,
            &spec(0.0, -100.0, -10.0),
            &mut control,
            |_, _, step| {
                if step.index == 3 {
                    handle.abort();
                }
                Ok(())
            },
        );
        assert!(matches!(result, Err(SqcError::Aborted)));
        assert_eq!(sim.voltage(), 0.0);
        assert!(sim.history().iter().all(|v| *v >= -50.0));
    }

    #[test]
    fn test_callback_error_recovers() {
        let sim = SimSourceMeter::new(1e9);
        let mut source = sim.clone();
        let (_handle, mut control) = RunControl::new();

        let result = engine().ramp(
            &mut source,
            &spec(0.0, 20.0, 5.0),
            &mut control,
            |_, _, step| {
                if step.voltage >= 10.0 {
                    Err(SqcError::Instrument("lcr timeout".to_string()))
                } else {
                    Ok(())
                }
            },
        );
        assert!(matches!(result, Err(SqcError::Instrument(_))));
        assert_eq!(sim.history(), vec![5.0, 10.0, 5.0, 0.0]);
    }

    #[test]
    fn test_ramp_to_zero_default_step() {
        let sim = SimSourceMeter::new(1e9);
        let mut source = sim.clone();
        source.set_voltage(-35.0).unwrap();
        sim.clear_history();
        engine().ramp_to_zero(&mut source).unwrap();
        assert_eq!(sim.history(), vec![-25.0, -15.0, -5.0, 0.0]);
    }
}
