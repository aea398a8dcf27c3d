//! Acquisition routines for every measurement type.
//!
//! Sweeps (iv, cv) emit one row per voltage point. Strip measurements run a
//! setup, wait for the environment interlock, check that the reading has
//! settled, reduce `n_samples` readings by median and emit one row with the
//! tolerance verdict. Their teardown always runs.

use log::{debug, error, info, warn};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use crate::control::RunControl;
use crate::error::{Result, SqcError};
use crate::instrument::{LcrMeter, SourceMeter};
use crate::interlock::EnvironmentMonitor;
use crate::ramp::{RampSpec, check_compliance};
use crate::recorder::{Recorder, Row};
use crate::sequence::{NodeKind, SequenceNode, StripPad, StripscanParams};
use crate::station::Station;
use crate::switching::RouteRequest;
use crate::types::Matrix;
use crate::units::{Quantity, Unit, format_metric};
use crate::utils::{linear_fit, median, sample_median};

/// Readings taken for an LCR open correction
pub const OPEN_CORRECTION_SAMPLES: usize = 50;
const VOLTAGE_READBACK_THRESHOLD_V: f64 = 0.25;

/// Open correction capacitance per node path, in farads
pub type OpenCorrections = BTreeMap<String, f64>;

/// Settling detection: repeated linear fits of readings over time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SteadyStateCheck {
    pub n_iterations: usize,
    pub n_samples: usize,
    pub waiting_time: Duration,
    /// Maximum |slope| per second
    pub max_slope: f64,
    /// Below this the fit is only reported as poor
    pub min_r_squared: f64,
    pub max_std_err: f64,
}

impl Default for SteadyStateCheck {
    fn default() -> Self {
        Self {
            n_iterations: 7,
            n_samples: 2,
            waiting_time: Duration::ZERO,
            max_slope: 1e-6,
            min_r_squared: 0.5,
            max_std_err: 1e-6,
        }
    }
}

impl SteadyStateCheck {
    pub fn new(min_r_squared: f64, max_slope: f64) -> Self {
        Self {
            min_r_squared,
            max_slope,
            ..Self::default()
        }
    }

    /// Returns `true` once a fit satisfies the slope and error bounds, `false`
    /// when every iteration failed
    pub fn run<F>(&self, control: &mut RunControl, mut read: F) -> Result<bool>
    where
        F: FnMut() -> Result<f64>,
    {
        let n_samples = self.n_samples.max(2);
        for iteration in 1..=self.n_iterations {
            let start = Instant::now();
            let mut times = Vec::with_capacity(n_samples);
            let mut values = Vec::with_capacity(n_samples);
            for _ in 0..n_samples {
                let t0 = Instant::now();
                values.push(read()?);
                times.push(start.elapsed().as_secs_f64());
                let dt = t0.elapsed();
                if dt < self.waiting_time {
                    control.wait(self.waiting_time - dt)?;
                }
            }

            // Readings returned faster than the clock resolution fall back to sample order
            let fit = linear_fit(&times, &values).or_else(|| {
                let order: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
                linear_fit(&order, &values)
            });
            let Some(fit) = fit else {
                continue;
            };
            debug!(
                "Steady state fit {iteration}: slope={:e}, r^2={:.3}, std_err={:e}",
                fit.slope, fit.r_squared, fit.std_err
            );
            if fit.std_err <= self.max_std_err && fit.slope.abs() <= self.max_slope.abs() {
                if fit.r_squared < self.min_r_squared {
                    debug!(
                        "Steady state reached with poor fit, r^2={:.3} at iteration {iteration}",
                        fit.r_squared
                    );
                }
                return Ok(true);
            }
        }
        info!(
            "Steady state not reached after {} iterations",
            self.n_iterations
        );
        Ok(false)
    }
}

/// Result of one strip measurement
#[derive(Debug, Clone, PartialEq)]
pub enum StripOutcome {
    /// Row emitted, value inside tolerance
    Passed,
    /// Row emitted, value outside tolerance
    OutOfTolerance(String),
    /// Reading never settled, no row
    Unsteady,
}

/// Everything a measurement routine touches
pub struct LeafContext<'a> {
    pub station: &'a mut Station,
    pub control: &'a mut RunControl,
    pub recorder: &'a mut dyn Recorder,
    /// Node path used in emitted rows
    pub path: &'a str,
    /// Open correction subtracted from every Cp reading
    pub open_cp: f64,
}

fn lcr_settings(kind: &NodeKind) -> Option<(f64, f64)> {
    match kind {
        NodeKind::Cv(p) => Some((p.lcr_amplitude.value(), p.lcr_frequency.value())),
        NodeKind::Cac(p) => Some((p.lcr_amplitude.value(), p.lcr_frequency.value())),
        NodeKind::Cint(p) => Some((p.lcr_amplitude.value(), p.lcr_frequency.value())),
        _ => None,
    }
}

/// Median of `n_samples` Cp readings with the node's switching applied
pub fn measure_open_correction(
    station: &mut Station,
    node: &SequenceNode,
    request: &RouteRequest,
    n_samples: usize,
) -> Result<f64> {
    let (amplitude, frequency) = lcr_settings(&node.kind).ok_or_else(|| {
        SqcError::Configuration(format!(
            "{} measurement {:?} has no LCR settings",
            node.kind.type_name(),
            node.name
        ))
    })?;
    station.switches.apply(request)?;
    let lcr = station.lcr.as_mut();
    let correction = sample_median(n_samples, || Ok(lcr.read_lcr(amplitude, frequency)?.0))?;
    info!(
        "Open correction for {:?} (median of {n_samples}): {}",
        node.name,
        format_metric(correction, Unit::Farad)
    );
    Ok(correction)
}

// === Sweeps ===

/// Runs an iv or cv sweep, returning the number of emitted rows.
///
/// The bias is ramped to `voltage_begin` without measuring, measured there,
/// then ramped to `voltage_end` measuring after every step. It always ends at zero.
pub fn run_sweep(ctx: &mut LeafContext<'_>, node: &SequenceNode) -> Result<usize> {
    let (spec, lcr) = match &node.kind {
        NodeKind::Iv(p) => (p.ramp(), None),
        NodeKind::Cv(p) => (p.ramp(), lcr_settings(&node.kind)),
        other => {
            return Err(SqcError::Configuration(format!(
                "{} is not a sweep measurement",
                other.type_name()
            )));
        }
    };

    let result = sweep(ctx, node, &spec, lcr);
    let station = &mut *ctx.station;
    let finalize = station
        .ramp
        .ramp_to_zero(station.bias.as_mut())
        .and_then(|_| station.bias.set_output(false));
    match (result, finalize) {
        (Ok(rows), Ok(())) => Ok(rows),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), finalize) => {
            if let Err(finalize_err) = finalize {
                warn!("Failed to finalize {}: {finalize_err}", ctx.path);
            }
            Err(err)
        }
    }
}

fn sweep(
    ctx: &mut LeafContext<'_>,
    node: &SequenceNode,
    spec: &RampSpec,
    lcr: Option<(f64, f64)>,
) -> Result<usize> {
    spec.points()?;
    let station = &mut *ctx.station;
    let control = &mut *ctx.control;
    let recorder = &mut *ctx.recorder;
    let compliance = spec.compliance.map(|c| c.value().abs());

    station.ramp.ramp_to_zero(station.smu.as_mut())?;
    station.smu.set_output(false)?;
    station.ramp.ramp_to_zero(station.bias.as_mut())?;
    if let Some(compliance) = compliance {
        station.bias.set_current_compliance(compliance)?;
    }
    station.bias.set_output(true)?;
    station.switches.apply(&node.route_request())?;
    station.environment.await_in_bounds(control)?;

    let begin = spec.begin.value();
    if begin != 0.0 {
        let approach = RampSpec {
            begin: Quantity::volts(0.0),
            end: spec.begin,
            step: Quantity::volts(spec.step.value().abs().copysign(begin)),
            waiting_time: Quantity::seconds(0.0),
            compliance: spec.compliance,
        };
        station
            .ramp
            .ramp(station.bias.as_mut(), &approach, control, |_, _, _| Ok(()))?;
    }

    let mut point = SweepPoint {
        recorder,
        environment: &mut station.environment,
        lcr: match lcr {
            Some((amplitude, frequency)) => {
                Some((station.lcr.as_mut(), amplitude, frequency, ctx.open_cp))
            }
            None => None,
        },
        path: ctx.path,
        kind: node.kind.type_name(),
        rows: 0,
    };

    station.bias.set_voltage(begin)?;
    control.wait(Duration::from_secs_f64(spec.waiting_time.value()))?;
    point.measure(station.bias.as_mut(), control, 0, begin)?;
    if let Err(err) = check_compliance(station.bias.as_mut(), begin, spec.compliance) {
        warn!("{err}, returning to zero");
        station.ramp.recover(station.bias.as_mut(), spec.step.value().abs())?;
        return Err(err);
    }

    station.ramp.ramp(station.bias.as_mut(), spec, control, |source, control, step| {
        point.measure(source, control, step.index + 1, step.voltage)
    })?;
    info!("{}: {} points measured", ctx.path, point.rows);
    Ok(point.rows)
}

struct SweepPoint<'a> {
    recorder: &'a mut dyn Recorder,
    environment: &'a mut EnvironmentMonitor,
    lcr: Option<(&'a mut dyn LcrMeter, f64, f64, f64)>,
    path: &'a str,
    kind: &'static str,
    rows: usize,
}

impl SweepPoint<'_> {
    /// Holds the point until the environment is in bounds, then records it
    fn measure(
        &mut self,
        bias: &mut dyn SourceMeter,
        control: &mut RunControl,
        index: usize,
        voltage: f64,
    ) -> Result<()> {
        let reading = self.environment.await_in_bounds(control)?;
        let mut row = Row::new(self.path, self.kind, index).environment(Some(reading));
        if let Some((lcr, amplitude, frequency, open_cp)) = self.lcr.as_mut() {
            let (cp, rp) = lcr.read_lcr(*amplitude, *frequency)?;
            row = row.value("lcr_cp", cp - *open_cp).value("lcr_rp", rp);
        }
        let current = bias.read_current()?;
        let measured = bias.read_voltage()?;
        if (voltage - measured).abs() > VOLTAGE_READBACK_THRESHOLD_V {
            warn!(
                "Bias voltage read back out of expected range: {}",
                format_metric(measured, Unit::Volt)
            );
        }
        debug!(
            "{} @ {}: I = {}",
            self.path,
            format_metric(voltage, Unit::Volt),
            format_metric(current, Unit::Ampere)
        );
        self.recorder.record(
            row.value("bias_voltage", voltage)
                .value("bias_smu_v", measured)
                .value("bias_smu_i", current),
        )?;
        self.rows += 1;
        Ok(())
    }
}

// === Stripscan ===

/// Prepares the stripscan bias: SMU off, needles down, switching, ramp to the bias voltage
pub fn start_stripscan(
    station: &mut Station,
    control: &mut RunControl,
    node: &SequenceNode,
    params: &StripscanParams,
) -> Result<()> {
    station.ramp.ramp_to_zero(station.smu.as_mut())?;
    station.smu.set_output(false)?;
    station.ramp.ramp_to_zero(station.bias.as_mut())?;
    station.bias.set_output(true)?;
    station
        .bias
        .set_current_compliance(params.bias_compliance.value().abs())?;
    station.motion.needles_down()?;
    station.switches.apply(&node.route_request())?;

    let begin = Quantity::volts(station.bias.voltage_level()?);
    let spec = params.ramp_from(begin);
    info!(
        "Ramping bias to {} for {:?}",
        params.bias_voltage, node.name
    );
    station
        .ramp
        .ramp(station.bias.as_mut(), &spec, control, |_, _, _| Ok(()))?;
    Ok(())
}

/// Checked before every strip
pub fn check_bias_compliance(station: &mut Station) -> Result<()> {
    if station.bias.compliance_tripped()? {
        let voltage = station.bias.voltage_level()?;
        let current = station.bias.read_current()?;
        return Err(SqcError::ComplianceTripped { voltage, current });
    }
    Ok(())
}

pub fn stop_stripscan(station: &mut Station) -> Result<()> {
    station.ramp.ramp_to_zero(station.bias.as_mut())?;
    station.bias.set_output(false)
}

// === Strip measurements ===

/// Measures one strip with an already contacted probe card.
///
/// `request` is the switching for this node, `istrip_request` the second
/// switching rpoly uses for the strip current.
pub fn run_strip_leaf(
    ctx: &mut LeafContext<'_>,
    node: &SequenceNode,
    request: &RouteRequest,
    istrip_request: &RouteRequest,
    strip: &StripPad,
    strip_index: usize,
) -> Result<StripOutcome> {
    let result = setup(ctx, node, request)
        .and_then(|_| acquire(ctx, node, istrip_request, strip, strip_index));
    let teardown = teardown(ctx.station, &node.kind);
    match (result, teardown) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), teardown) => {
            if let Err(teardown_err) = teardown {
                warn!("Failed to finalize {}: {teardown_err}", ctx.path);
            }
            Err(err)
        }
    }
}

fn start_smu(station: &mut Station, compliance: Quantity, voltage: Quantity) -> Result<()> {
    station.ramp.ramp_to_zero(station.smu.as_mut())?;
    station.smu.set_current_compliance(compliance.value().abs())?;
    station.smu.set_output(true)?;
    station.smu.set_voltage(voltage.value())
}

fn stop_smu(station: &mut Station) -> Result<()> {
    station.ramp.ramp_to_zero(station.smu.as_mut())?;
    station.smu.set_output(false)
}

fn setup(ctx: &mut LeafContext<'_>, node: &SequenceNode, request: &RouteRequest) -> Result<()> {
    let station = &mut *ctx.station;
    station.switches.apply(request)?;
    match &node.kind {
        NodeKind::Istrip(_) => station.elm.set_zero_check(false),
        NodeKind::Rpoly(p) => start_smu(station, p.smu_compliance, p.smu_voltage),
        NodeKind::Idiel(p) => start_smu(station, p.smu_compliance, p.smu_voltage),
        NodeKind::Rint(p) => {
            station.ramp.ramp_to_zero(station.smu.as_mut())?;
            station
                .smu
                .set_current_compliance(p.smu_compliance.value().abs())?;
            station.smu.set_output(true)?;
            let begin = p.smu_voltage_begin.value();
            let approach = RampSpec {
                begin: Quantity::volts(0.0),
                end: p.smu_voltage_begin,
                step: Quantity::volts(p.smu_voltage_step.value().abs().copysign(begin)),
                waiting_time: Quantity::seconds(0.0),
                compliance: Some(p.smu_compliance),
            };
            station
                .ramp
                .ramp(station.smu.as_mut(), &approach, ctx.control, |_, _, _| Ok(()))?;
            station.elm.set_zero_check(false)
        }
        NodeKind::Cint(_) => station.motion.needles_up(),
        NodeKind::Cac(_) | NodeKind::Idark(_) => Ok(()),
        other => Err(SqcError::Configuration(format!(
            "{} is not a strip measurement",
            other.type_name()
        ))),
    }
}

fn teardown(station: &mut Station, kind: &NodeKind) -> Result<()> {
    match kind {
        NodeKind::Istrip(_) => station.elm.set_zero_check(true),
        NodeKind::Rpoly(_) | NodeKind::Rint(_) => {
            station.elm.set_zero_check(true)?;
            stop_smu(station)
        }
        NodeKind::Idiel(_) => stop_smu(station),
        NodeKind::Cint(_) => station.motion.needles_down(),
        _ => Ok(()),
    }
}

fn acquire(
    ctx: &mut LeafContext<'_>,
    node: &SequenceNode,
    istrip_request: &RouteRequest,
    strip: &StripPad,
    strip_index: usize,
) -> Result<StripOutcome> {
    let reading = ctx.station.environment.await_in_bounds(ctx.control)?;
    let station = &mut *ctx.station;
    let control = &mut *ctx.control;
    let open_cp = ctx.open_cp;

    let unsteady = || -> Result<StripOutcome> {
        error!(
            "Steady state check failed, skipping {} for strip {}",
            node.name, strip.name
        );
        Ok(StripOutcome::Unsteady)
    };

    let (values, primary): (Vec<(&str, Value)>, Quantity) = match &node.kind {
        NodeKind::Istrip(p) => {
            let elm = station.elm.as_mut();
            if !SteadyStateCheck::new(0.5, 1e-6).run(control, || elm.read_current())? {
                return unsteady();
            }
            let istrip_i = sample_median(p.n_samples, || elm.read_current())?;
            (vec![("istrip_i", istrip_i.into())], Quantity::amperes(istrip_i))
        }
        NodeKind::Idiel(p) => {
            let smu = station.smu.as_mut();
            if !SteadyStateCheck::new(0.3, 1e-6).run(control, || smu.read_current())? {
                return unsteady();
            }
            let idiel_i = sample_median(p.n_samples, || smu.read_current())?;
            (vec![("idiel_i", idiel_i.into())], Quantity::amperes(idiel_i))
        }
        NodeKind::Idark(p) => {
            let bias = station.bias.as_mut();
            if !SteadyStateCheck::new(0.5, 1e-6).run(control, || bias.read_current())? {
                return unsteady();
            }
            let idark_i = sample_median(p.n_samples, || bias.read_current())?;
            let idark_v = bias.read_voltage()?;
            (
                vec![("idark_i", idark_i.into()), ("idark_v", idark_v.into())],
                Quantity::amperes(idark_i),
            )
        }
        NodeKind::Rpoly(p) => {
            let smu = station.smu.as_mut();
            if !SteadyStateCheck::new(0.5, 1e-6).run(control, || smu.read_current())? {
                return unsteady();
            }
            if smu.compliance_tripped()? {
                error!("SMU compliance tripped during {}", node.name);
            }
            let rpoly_i = sample_median(p.n_samples, || smu.read_current())?;
            let rpoly_u = smu.read_voltage()?;
            stop_smu(station)?;

            station.switches.apply(istrip_request)?;
            station.elm.set_zero_check(false)?;
            let elm = station.elm.as_mut();
            if !SteadyStateCheck::new(0.5, 1e-6).run(control, || elm.read_current())? {
                return unsteady();
            }
            let istrip_i = sample_median(p.n_samples, || elm.read_current())?;
            let rpoly_r = rpoly_u / (rpoly_i - istrip_i);
            info!("Calculated rpoly_r: {}", format_metric(rpoly_r, Unit::Ohm));
            (
                vec![
                    ("rpoly_r", rpoly_r.into()),
                    ("rpoly_i", rpoly_i.into()),
                    ("rpoly_istrip_i", istrip_i.into()),
                    ("rpoly_u", rpoly_u.into()),
                ],
                Quantity::ohms(rpoly_r),
            )
        }
        NodeKind::Rint(p) => {
            if !SteadyStateCheck::new(0.3, 1e-2).run(control, || station.elm.read_current())? {
                return unsteady();
            }
            if station.smu.compliance_tripped()? {
                error!("SMU compliance tripped during {}", node.name);
            }
            let mut rint_u = Vec::new();
            let mut rint_i = Vec::new();
            let begin = station.smu.voltage_level()?;
            rint_u.push(begin);
            rint_i.push(sample_median(p.n_samples, || station.elm.read_current())?);

            let spec = RampSpec {
                begin: Quantity::volts(begin),
                ..p.ramp()
            };
            let elm = station.elm.as_mut();
            station.ramp.ramp(station.smu.as_mut(), &spec, control, |_, _, step| {
                rint_i.push(sample_median(p.n_samples, || elm.read_current())?);
                rint_u.push(step.voltage);
                Ok(())
            })?;

            let fit = linear_fit(&rint_u, &rint_i).ok_or_else(|| {
                SqcError::Instrument(format!(
                    "rint sweep of {:?} produced too few points for a fit",
                    node.name
                ))
            })?;
            let rint_r = 1.0 / fit.slope;
            if !rint_r.is_finite() {
                warn!("Rint fit for strip {} has zero slope", strip.name);
            }
            info!("Calculated rint_r: {}", format_metric(rint_r, Unit::Ohm));
            (
                vec![
                    ("rint_r", rint_r.into()),
                    ("rint_u", rint_u.into()),
                    ("rint_i", rint_i.into()),
                ],
                Quantity::ohms(rint_r),
            )
        }
        NodeKind::Cac(p) => {
            let Some((cp, rp)) = lcr_median(
                station.lcr.as_mut(),
                control,
                p.lcr_amplitude.value(),
                p.lcr_frequency.value(),
                open_cp,
                p.n_samples,
                0.5,
            )?
            else {
                return unsteady();
            };
            (
                vec![("cac_cp", cp.into()), ("cac_rp", rp.into())],
                Quantity::farads(cp),
            )
        }
        NodeKind::Cint(p) => {
            let Some((cp, rp)) = lcr_median(
                station.lcr.as_mut(),
                control,
                p.lcr_amplitude.value(),
                p.lcr_frequency.value(),
                open_cp,
                p.n_samples,
                0.3,
            )?
            else {
                return unsteady();
            };
            (
                vec![("cint_cp", cp.into()), ("cint_rp", rp.into())],
                Quantity::farads(cp),
            )
        }
        other => {
            return Err(SqcError::Configuration(format!(
                "{} is not a strip measurement",
                other.type_name()
            )));
        }
    };

    let tolerance = node.kind.tolerance();
    let passed = tolerance.check(&primary)?;
    let row = values
        .into_iter()
        .fold(
            Row::new(ctx.path, node.kind.type_name(), strip_index)
                .environment(Some(reading))
                .strip(&strip.name, strip_index),
            |row, (key, value)| row.value(key, value),
        )
        .tolerance_ok(passed);
    ctx.recorder.record(row)?;

    if passed {
        Ok(StripOutcome::Passed)
    } else {
        let describe = |bound: Option<Quantity>| bound.map_or("-".to_string(), |q| q.to_string());
        let message = format!(
            "{} on strip {}: {} outside [{}, {}]",
            node.name,
            strip.name,
            primary.abs(),
            describe(tolerance.minimum),
            describe(tolerance.maximum)
        );
        warn!("Value out of range: {message}");
        Ok(StripOutcome::OutOfTolerance(message))
    }
}

/// Corrected Cp and Rp medians, `None` when the Cp reading does not settle
fn lcr_median(
    lcr: &mut dyn LcrMeter,
    control: &mut RunControl,
    amplitude: f64,
    frequency: f64,
    open_cp: f64,
    n_samples: usize,
    min_r_squared: f64,
) -> Result<Option<(f64, f64)>> {
    let steady = SteadyStateCheck::new(min_r_squared, 1e-6)
        .run(control, || Ok(lcr.read_lcr(amplitude, frequency)?.0 - open_cp))?;
    if !steady {
        return Ok(None);
    }
    if n_samples == 0 {
        return Err(SqcError::Configuration(
            "n_samples must be greater than zero".to_string(),
        ));
    }
    let mut cp = Vec::with_capacity(n_samples);
    let mut rp = Vec::with_capacity(n_samples);
    for _ in 0..n_samples {
        let (c, r) = lcr.read_lcr(amplitude, frequency)?;
        debug!(
            "Cp correction: corr={open_cp:e}, value={c:e}, (value-corr)={:e}",
            c - open_cp
        );
        cp.push(c - open_cp);
        rp.push(r);
    }
    match (median(&cp), median(&rp)) {
        (Some(cp), Some(rp)) => Ok(Some((cp, rp))),
        _ => Err(SqcError::Instrument("no LCR samples acquired".to_string())),
    }
}

/// Switching for a strip measurement inside `stripscan`; HV routes are
/// inherited from the stripscan when the measurement has none
pub fn strip_requests(stripscan: &SequenceNode, node: &SequenceNode) -> (RouteRequest, RouteRequest) {
    let parent = stripscan.route_request();
    let request = node.route_request().inherit(Matrix::Hv, &parent);
    let istrip = match &node.kind {
        NodeKind::Rpoly(p) => node
            .routing
            .istrip_request(&node.kind, &p.lv_channels_istrip)
            .inherit(Matrix::Hv, &parent),
        _ => request.clone(),
    };
    (request, istrip)
}
