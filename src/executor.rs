use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::control::RunControl;
use crate::error::{FailureKind, Result, SqcError};
use crate::measurements::{
    LeafContext, OPEN_CORRECTION_SAMPLES, OpenCorrections, StripOutcome, check_bias_compliance,
    measure_open_correction, run_strip_leaf, run_sweep, start_stripscan, stop_stripscan,
    strip_requests,
};
use crate::recorder::{Recorder, Row};
use crate::sequence::{NodeKind, Sequence, SequenceNode, StripLayout, StripPad, StripscanParams};
use crate::station::Station;
use crate::types::{EnvironmentReading, Position};
use crate::utils::parse_strips;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed(FailureKind),
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeFailure {
    pub strip: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub state: NodeState,
    pub rows: usize,
    pub failures: Vec<NodeFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Completed,
    Aborted,
}

/// Remeasure and recontact counters per strip and node path
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub remeasure: BTreeMap<String, BTreeMap<String, usize>>,
    pub recontact: BTreeMap<String, BTreeMap<String, usize>>,
}

impl Statistics {
    fn increment(
        counter: &mut BTreeMap<String, BTreeMap<String, usize>>,
        strip: &str,
        path: &str,
    ) {
        *counter
            .entry(strip.to_string())
            .or_default()
            .entry(path.to_string())
            .or_default() += 1;
    }

    pub fn increment_remeasure(&mut self, strip: &str, path: &str) {
        Self::increment(&mut self.remeasure, strip, path);
    }

    pub fn increment_recontact(&mut self, strip: &str, path: &str) {
        Self::increment(&mut self.recontact, strip, path);
    }

    pub fn remeasure_total(&self) -> usize {
        self.remeasure.values().flat_map(|m| m.values()).sum()
    }

    pub fn recontact_total(&self) -> usize {
        self.recontact.values().flat_map(|m| m.values()).sum()
    }

    fn log(&self, options: &RunOptions) {
        if !self.remeasure.is_empty() {
            let possible = options.remeasure_count * (options.recontact_count + 1);
            info!("-------- Remeasurement Statistics --------");
            for (strip, counter) in &self.remeasure {
                for (path, count) in counter {
                    info!("Strip {strip:?}, {path:?}: {count}/{possible}");
                }
            }
        }
        if !self.recontact.is_empty() {
            info!("-------- Recontact Statistics --------");
            for (strip, counter) in &self.recontact {
                for (path, count) in counter {
                    info!(
                        "Strip {strip:?}, {path:?}: {count}/{}",
                        options.recontact_count
                    );
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub nodes: Vec<NodeReport>,
    pub statistics: Statistics,
}

impl RunReport {
    pub fn node(&self, path: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.path == path)
    }

    pub fn state(&self, path: &str) -> Option<NodeState> {
        self.node(path).map(|n| n.state)
    }
}

/// Retry policy and open correction settings of one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// In-place repetitions of a strip measurement outside tolerance
    pub remeasure_count: usize,
    /// Recontacts of a strip once the remeasurements are exhausted
    pub recontact_count: usize,
    pub open_correction_samples: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            remeasure_count: 0,
            recontact_count: 0,
            open_correction_samples: OPEN_CORRECTION_SAMPLES,
        }
    }
}

/// Mutable state of the active run
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub current_path: Option<String>,
    pub current_strip: Option<String>,
    pub last_reading: Option<EnvironmentReading>,
    pub position: Option<Position>,
    pub aborted: bool,
    pub open_corrections: OpenCorrections,
    pub statistics: Statistics,
}

/// Selected strips of a stripscan with the children measured on each, strip-major.
///
/// A strip is selected by the stripscan's strip expression; a child runs on it
/// when the child's own expression also selects it and the strip's layout
/// index is a multiple of the child's interval. Disabled children never run.
pub fn strip_pattern(layout: &StripLayout, stripscan: &SequenceNode) -> Result<Vec<(usize, Vec<usize>)>> {
    let names = layout.names();
    let selected: BTreeSet<String> = parse_strips(&names, &stripscan.strips)?.into_iter().collect();
    let children = stripscan
        .children
        .iter()
        .enumerate()
        .filter(|(_, child)| child.enabled)
        .map(|(i, child)| {
            let strips: BTreeSet<String> = parse_strips(&names, &child.strips)?.into_iter().collect();
            Ok((i, child.interval.max(1), strips))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(names
        .iter()
        .enumerate()
        .filter(|(_, name)| selected.contains(*name))
        .filter_map(|(index, name)| {
            let items: Vec<usize> = children
                .iter()
                .filter(|(_, interval, strips)| index % interval == 0 && strips.contains(name))
                .map(|(i, _, _)| *i)
                .collect();
            (!items.is_empty()).then_some((index, items))
        })
        .collect())
}

/// Counts rows passing through to the run recorder
struct Tally<'r> {
    inner: &'r mut dyn Recorder,
    rows: usize,
    last: Option<EnvironmentReading>,
}

impl Recorder for Tally<'_> {
    fn record(&mut self, row: Row) -> Result<()> {
        if let (Some(temperature), Some(humidity)) = (row.temperature, row.humidity) {
            self.last = Some(EnvironmentReading {
                temperature,
                humidity,
                test_running: true,
            });
        }
        self.inner.record(row)?;
        self.rows += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.inner.finish()
    }
}

enum StripItem {
    Done,
    Recontact,
}

fn halts_run(err: &SqcError) -> bool {
    err.is_aborted() || err.kind().escalates_to_abort()
}

/// Walks a measurement tree on one station
pub struct Executor<'a> {
    station: &'a mut Station,
    recorder: &'a mut dyn Recorder,
    control: &'a mut RunControl,
    layout: &'a StripLayout,
    options: RunOptions,
    context: RunContext,
    reports: Vec<NodeReport>,
    excluded: BTreeSet<String>,
}

impl<'a> Executor<'a> {
    pub fn new(
        station: &'a mut Station,
        recorder: &'a mut dyn Recorder,
        control: &'a mut RunControl,
        layout: &'a StripLayout,
        options: RunOptions,
    ) -> Self {
        Self {
            station,
            recorder,
            control,
            layout,
            options,
            context: RunContext::default(),
            reports: Vec::new(),
            excluded: BTreeSet::new(),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Runs every enabled node of `sequence`.
    ///
    /// Configuration problems and a busy rig are returned as errors before
    /// anything moves; every other failure is attached to its node in the
    /// report. The station always ends in its safe state.
    pub fn run(&mut self, sequence: &mut Sequence) -> Result<RunReport> {
        let _guard = self.station.lock_run()?;
        sequence.validate_against(self.layout)?;

        let started = Utc::now();
        self.context = RunContext::default();
        self.excluded.clear();
        self.reports = Self::initial_reports(sequence);

        let result = self.execute(sequence);
        let outcome = match result {
            Ok(()) => RunOutcome::Completed,
            Err(err) => {
                if err.is_aborted() {
                    warn!("Run aborted");
                } else {
                    error!("Run aborted: {err}");
                }
                self.context.aborted = true;
                for report in &mut self.reports {
                    if report.state == NodeState::Running {
                        report.state = NodeState::Aborted;
                    }
                }
                RunOutcome::Aborted
            }
        };

        self.finalize();
        self.context.statistics.log(&self.options);
        if let Err(err) = self.recorder.finish() {
            error!("Failed to finish recording: {err}");
        }

        Ok(RunReport {
            outcome,
            started,
            finished: Utc::now(),
            nodes: self.reports.clone(),
            statistics: self.context.statistics.clone(),
        })
    }

    fn initial_reports(sequence: &Sequence) -> Vec<NodeReport> {
        let mut reports = Vec::new();
        for node in &sequence.nodes {
            let state = if node.enabled {
                NodeState::Pending
            } else {
                NodeState::Skipped
            };
            reports.push(NodeReport {
                path: node.name.clone(),
                kind: node.kind.type_name(),
                state,
                rows: 0,
                failures: Vec::new(),
            });
            for child in &node.children {
                let state = if node.enabled && child.enabled {
                    NodeState::Pending
                } else {
                    NodeState::Skipped
                };
                reports.push(NodeReport {
                    path: child_path(node, child),
                    kind: child.kind.type_name(),
                    state,
                    rows: 0,
                    failures: Vec::new(),
                });
            }
        }
        reports
    }

    fn report_mut(&mut self, path: &str) -> Option<&mut NodeReport> {
        self.reports.iter_mut().find(|r| r.path == path)
    }

    fn state(&self, path: &str) -> Option<NodeState> {
        self.reports.iter().find(|r| r.path == path).map(|r| r.state)
    }

    fn mark_running(&mut self, path: &str) {
        if let Some(report) = self.report_mut(path) {
            if report.state == NodeState::Pending {
                report.state = NodeState::Running;
            }
        }
    }

    /// Records the failure on the node. A failure that halts the run leaves the
    /// node running so the abort marks it `Aborted`.
    fn fail(&mut self, path: &str, strip: Option<&str>, err: &SqcError) {
        let kind = err.kind();
        match strip {
            Some(strip) => error!("{path} failed on strip {strip}: {err}"),
            None => error!("{path} failed: {err}"),
        }
        if let Some(report) = self.report_mut(path) {
            report.failures.push(NodeFailure {
                strip: strip.map(str::to_string),
                kind,
                message: err.to_string(),
            });
            if !halts_run(err) {
                report.state = NodeState::Failed(kind);
            }
        }
    }

    fn passed(&self, path: &str) -> bool {
        self.reports
            .iter()
            .find(|r| r.path == path)
            .is_some_and(|r| r.state == NodeState::Completed && r.failures.is_empty())
    }

    fn add_rows(&mut self, path: &str, rows: usize, last: Option<EnvironmentReading>) {
        if last.is_some() {
            self.context.last_reading = last;
        }
        if let Some(report) = self.report_mut(path) {
            report.rows += rows;
        }
    }

    fn execute(&mut self, sequence: &mut Sequence) -> Result<()> {
        self.initialize()?;
        self.before_sequence(sequence)?;

        for node in sequence.nodes.iter_mut() {
            if !node.enabled || self.excluded.contains(&node.name) {
                continue;
            }
            self.control.check_point()?;
            self.run_node(node)?;
        }
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        info!("Initialize...");
        self.station.environment.set_test_running(true)?;
        self.station.initialize()?;
        let position = self.station.motion.safe_recover(self.control)?;
        self.context.position = Some(position);
        Ok(())
    }

    /// Returns the table and every instrument to rest; never cancelled
    fn finalize(&mut self) {
        info!("Finalize...");
        let (_handle, mut detached) = RunControl::new();
        match self.station.motion.safe_recover(&mut detached) {
            Ok(position) => self.context.position = Some(position),
            Err(err) => warn!("Failed to recover table: {err}"),
        }
        if let Err(err) = self.station.safe_state() {
            error!("Safe state incomplete: {err}");
        }
        if let Err(err) = self.station.environment.set_test_running(false) {
            warn!("Failed to clear test running flag: {err}");
        }
        self.context.current_path = None;
        self.context.current_strip = None;
        info!("Done.");
    }

    /// Acquires LCR open corrections for every enabled node that needs one
    fn before_sequence(&mut self, sequence: &Sequence) -> Result<()> {
        let samples = self.options.open_correction_samples;
        for node in sequence.nodes.iter().filter(|n| n.enabled) {
            self.control.check_abort()?;
            if node.kind.needs_open_correction() {
                let request = node.route_request();
                match measure_open_correction(self.station, node, &request, samples) {
                    Ok(cp) => {
                        self.context.open_corrections.insert(node.name.clone(), cp);
                    }
                    Err(err) if halts_run(&err) => return Err(err),
                    Err(err) => {
                        self.fail(&node.name, None, &err);
                        self.excluded.insert(node.name.clone());
                    }
                }
            }
            for child in node.children.iter().filter(|c| c.enabled) {
                if !child.kind.needs_open_correction() {
                    continue;
                }
                self.control.check_abort()?;
                let path = child_path(node, child);
                let (request, _) = strip_requests(node, child);
                match measure_open_correction(self.station, child, &request, samples) {
                    Ok(cp) => {
                        self.context.open_corrections.insert(path, cp);
                    }
                    Err(err) if halts_run(&err) => return Err(err),
                    Err(err) => {
                        self.fail(&path, None, &err);
                        self.excluded.insert(path);
                    }
                }
            }
        }
        Ok(())
    }

    fn run_node(&mut self, node: &mut SequenceNode) -> Result<()> {
        let path = node.name.clone();
        info!("-------- {path} --------");
        self.context.current_path = Some(path.clone());
        self.context.current_strip = None;
        self.mark_running(&path);

        let result = match &node.kind {
            NodeKind::Stripscan(params) => {
                let result = self.run_stripscan(node, params);
                if !result.as_ref().is_err_and(halts_run) {
                    self.settle_children(node);
                }
                result
            }
            NodeKind::Iv(_) | NodeKind::Cv(_) => self.run_sweep_node(node),
            other => Err(SqcError::Configuration(format!(
                "{} measurement {path:?} cannot run at top level",
                other.type_name()
            ))),
        };

        match result {
            Ok(()) => {
                if self.state(&path) == Some(NodeState::Running) {
                    if let Some(report) = self.report_mut(&path) {
                        report.state = NodeState::Completed;
                    }
                }
            }
            Err(err) if halts_run(&err) => return Err(err),
            Err(err) => self.fail(&path, None, &err),
        }

        for child in node.children.iter_mut() {
            let child_path = format!("{path}/{}", child.name);
            if child.auto_disable && self.passed(&child_path) {
                info!("Auto-disabling {child_path}");
                child.enabled = false;
            }
        }
        if node.auto_disable && self.passed(&path) {
            info!("Auto-disabling {path}");
            node.enabled = false;
        }
        Ok(())
    }

    fn run_sweep_node(&mut self, node: &SequenceNode) -> Result<()> {
        let path = node.name.as_str();
        let open_cp = self.context.open_corrections.get(path).copied().unwrap_or(0.0);
        let mut tally = Tally {
            inner: &mut *self.recorder,
            rows: 0,
            last: None,
        };
        let result = {
            let mut ctx = LeafContext {
                station: &mut *self.station,
                control: &mut *self.control,
                recorder: &mut tally,
                path,
                open_cp,
            };
            run_sweep(&mut ctx, node)
        };
        let (rows, last) = (tally.rows, tally.last);
        self.add_rows(path, rows, last);
        result.map(|_| ())
    }

    fn run_stripscan(&mut self, node: &SequenceNode, params: &StripscanParams) -> Result<()> {
        let pattern = strip_pattern(self.layout, node)?;
        info!("{}: {} strips to measure", node.name, pattern.len());

        if let Err(err) = start_stripscan(self.station, self.control, node, params) {
            if let Err(stop_err) = stop_stripscan(self.station) {
                warn!("Failed to ramp down bias: {stop_err}");
            }
            return Err(err);
        }
        let scan = self.scan_strips(node, &pattern);
        let stop = stop_stripscan(self.station);
        match (scan, stop) {
            (Ok(()), stop) => stop,
            (Err(err), stop) => {
                if let Err(stop_err) = stop {
                    warn!("Failed to ramp down bias: {stop_err}");
                }
                Err(err)
            }
        }
    }

    fn scan_strips(&mut self, node: &SequenceNode, pattern: &[(usize, Vec<usize>)]) -> Result<()> {
        let layout = self.layout;
        let total = pattern.len();
        for (done, (strip_index, items)) in pattern.iter().enumerate() {
            self.control.check_point()?;
            let pad = &layout.strips[*strip_index];
            if !pad.contact {
                warn!("Skipping invalid strip: {}", pad.name);
                continue;
            }
            let items: Vec<&SequenceNode> = items
                .iter()
                .map(|&i| &node.children[i])
                .filter(|child| !self.excluded.contains(&child_path(node, child)))
                .collect();
            if items.is_empty() {
                continue;
            }
            info!("Strip {} ({}/{total})", pad.name, done + 1);
            self.context.current_strip = Some(pad.name.clone());
            self.measure_strip(node, pad, *strip_index, &items)?;
        }
        self.context.current_strip = None;
        Ok(())
    }

    /// Contacts one strip and runs its measurements, recontacting while a
    /// measurement stays outside tolerance
    fn measure_strip(
        &mut self,
        node: &SequenceNode,
        pad: &StripPad,
        strip_index: usize,
        items: &[&SequenceNode],
    ) -> Result<()> {
        let attempts = self.options.recontact_count;
        for attempt in 0..=attempts {
            if attempt > 0 {
                warn!(
                    "Remeasurement failed, recontacting strip {} ({attempt}/{attempts})",
                    pad.name
                );
                self.context
                    .statistics
                    .increment_recontact(&pad.name, &node.name);
            }
            let offset = self.station.motion.settings().recontact_offset(attempt);
            if offset != 0.0 {
                info!("Applied recontact offset to x-position: {offset:+} um");
            }
            let target = pad.position().offset(offset, 0.0, 0.0);

            check_bias_compliance(self.station)?;
            match self.station.motion.contact(target, self.control) {
                Ok(position) => self.context.position = Some(position),
                Err(err) => {
                    if !err.is_aborted() {
                        self.fail(&node.name, Some(&pad.name), &err);
                    }
                    return Err(err);
                }
            }

            let last_attempt = attempt == attempts;
            let mut recontact = false;
            for child in items {
                self.control.check_abort()?;
                let path = child_path(node, child);
                if self.excluded.contains(&path) {
                    continue;
                }
                match self.measure_strip_item(node, child, &path, pad, strip_index, last_attempt)? {
                    StripItem::Done => {}
                    StripItem::Recontact => {
                        recontact = true;
                        break;
                    }
                }
            }

            match self.station.motion.safe_recover(self.control) {
                Ok(position) => self.context.position = Some(position),
                Err(err) => {
                    if !err.is_aborted() {
                        self.fail(&node.name, Some(&pad.name), &err);
                    }
                    return Err(err);
                }
            }
            if !recontact {
                break;
            }
        }
        Ok(())
    }

    fn measure_strip_item(
        &mut self,
        stripscan: &SequenceNode,
        child: &SequenceNode,
        path: &str,
        pad: &StripPad,
        strip_index: usize,
        last_attempt: bool,
    ) -> Result<StripItem> {
        info!("-------- #{} {path} --------", pad.name);
        self.context.current_path = Some(path.to_string());
        self.mark_running(path);

        let (request, istrip) = strip_requests(stripscan, child);
        let open_cp = self.context.open_corrections.get(path).copied().unwrap_or(0.0);
        let attempts = self.options.remeasure_count;
        let mut out_of_range = None;

        for attempt in 0..=attempts {
            if attempt > 0 {
                warn!("Analysis failed, repeating measurement {path:?} in place ({attempt}/{attempts})");
                self.context
                    .statistics
                    .increment_remeasure(&pad.name, path);
            }

            let mut tally = Tally {
                inner: &mut *self.recorder,
                rows: 0,
                last: None,
            };
            let result = {
                let mut ctx = LeafContext {
                    station: &mut *self.station,
                    control: &mut *self.control,
                    recorder: &mut tally,
                    path,
                    open_cp,
                };
                run_strip_leaf(&mut ctx, child, &request, &istrip, pad, strip_index)
            };
            let (rows, last) = (tally.rows, tally.last);
            self.add_rows(path, rows, last);

            match result {
                Ok(StripOutcome::Passed) | Ok(StripOutcome::Unsteady) => return Ok(StripItem::Done),
                Ok(StripOutcome::OutOfTolerance(message)) => out_of_range = Some(message),
                Err(err) => {
                    if err.is_aborted() {
                        return Err(err);
                    }
                    self.fail(path, Some(&pad.name), &err);
                    if halts_run(&err) {
                        return Err(err);
                    }
                    warn!("Excluding {path} from the remaining strips");
                    self.excluded.insert(path.to_string());
                    return Ok(StripItem::Done);
                }
            }
        }

        if last_attempt {
            let message = out_of_range.unwrap_or_default();
            self.fail(path, Some(&pad.name), &SqcError::ToleranceOutOfRange(message));
            Ok(StripItem::Done)
        } else {
            Ok(StripItem::Recontact)
        }
    }

    /// Final state of the children once their stripscan is done
    fn settle_children(&mut self, node: &SequenceNode) {
        for child in &node.children {
            let path = child_path(node, child);
            if let Some(report) = self.report_mut(&path) {
                report.state = match report.state {
                    NodeState::Running => NodeState::Completed,
                    NodeState::Pending => NodeState::Skipped,
                    other => other,
                };
            }
        }
    }
}

fn child_path(parent: &SequenceNode, child: &SequenceNode) -> String {
    format!("{}/{}", parent.name, child.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RunHandle;
    use crate::motion::MotionSettings;
    use crate::recorder::MemoryRecorder;
    use crate::sim::{SimRig, SimSourceMeter};
    use crate::station::StationBuilder;
    use std::time::Duration;

    fn fast_motion() -> MotionSettings {
        MotionSettings {
            approach_settle_ms: 0,
            poll_interval_ms: 1,
            move_timeout_s: 0.2,
            ..MotionSettings::default()
        }
    }

    fn tuned(builder: StationBuilder) -> Station {
        builder
            .recover_settle(Duration::ZERO)
            .interlock_timing(Duration::from_millis(1), Duration::from_secs(2))
            .motion_settings(fast_motion())
            .build()
            .unwrap()
    }

    fn run(
        station: &mut Station,
        sequence: &mut Sequence,
        layout: &StripLayout,
        options: RunOptions,
    ) -> (RunReport, MemoryRecorder) {
        let (_handle, mut control) = RunControl::new();
        let mut recorder = MemoryRecorder::new();
        let report = Executor::new(station, &mut recorder, &mut control, layout, options)
            .run(sequence)
            .unwrap();
        (report, recorder)
    }

    const STRIPSCAN: &str = r#"
[[measurements]]
type = "stripscan"
name = "Stripscan"
[measurements.parameters]
bias_voltage = -100
bias_compliance = "1 uA"
waiting_time = 0
hv_channels = ["A1"]

[[measurements.strip_measurements]]
type = "istrip"
name = "Istrip"
interval = 4
[measurements.strip_measurements.parameters]
istrip_i_maximum = "1 nA"
lv_channels = ["1C05"]
"#;

    #[test]
    fn test_strip_pattern_interval() {
        let sequence = Sequence::from_toml_str(STRIPSCAN).unwrap();
        let layout = StripLayout::linear(20, 80.0, 1000.0);
        let pattern = strip_pattern(&layout, &sequence.nodes[0]).unwrap();
        let strips: Vec<&str> = pattern
            .iter()
            .map(|(i, _)| layout.strips[*i].name.as_str())
            .collect();
        assert_eq!(strips, vec!["P1", "P5", "P9", "P13", "P17"]);
    }

    #[test]
    fn test_strip_pattern_is_strip_major() {
        let text = format!(
            "{STRIPSCAN}\n{}",
            r#"
[[measurements.strip_measurements]]
type = "idark"
name = "Idark"
interval = 2
"#
        );
        let mut sequence = Sequence::from_toml_str(&text).unwrap();
        sequence.nodes[0].strips = "P3-P6".to_string();
        let layout = StripLayout::linear(8, 80.0, 1000.0);
        let pattern = strip_pattern(&layout, &sequence.nodes[0]).unwrap();
        assert_eq!(pattern, vec![(2, vec![1]), (4, vec![0, 1])]);

        sequence.nodes[0].children[1].enabled = false;
        let pattern = strip_pattern(&layout, &sequence.nodes[0]).unwrap();
        assert_eq!(pattern, vec![(4, vec![0])]);
    }

    #[test]
    fn test_stripscan_interval_run() {
        let rig = SimRig::new();
        let mut station = tuned(rig.builder());
        let mut sequence = Sequence::from_toml_str(STRIPSCAN).unwrap();
        let layout = StripLayout::linear(20, 80.0, 1000.0);

        let (report, recorder) = run(&mut station, &mut sequence, &layout, RunOptions::default());
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.state("Stripscan"), Some(NodeState::Completed));
        assert_eq!(report.state("Stripscan/Istrip"), Some(NodeState::Completed));
        assert_eq!(report.node("Stripscan/Istrip").unwrap().rows, 5);

        let strips: Vec<&str> = recorder
            .rows
            .iter()
            .filter_map(|r| r.strip.as_deref())
            .collect();
        assert_eq!(strips, vec!["P1", "P5", "P9", "P13", "P17"]);

        assert_eq!(rig.bias.voltage(), 0.0);
        assert!(!rig.bias.is_output_on());
        assert!(rig.hv.closed().is_empty());
        assert!(rig.lv.closed().is_empty());
        assert!(!rig.environment.test_running());
    }

    #[test]
    fn test_cv_compliance_fails_node_and_siblings_continue() {
        let rig = SimRig {
            bias: SimSourceMeter::new(1e9).trip_at(-200.0),
            ..SimRig::new()
        };
        let mut station = tuned(rig.builder());
        let mut sequence = Sequence::from_toml_str(
            r#"
[[measurements]]
type = "cv"
name = "CV"
[measurements.parameters]
voltage_end = -800
voltage_step = -5
waiting_time = 0
compliance = "10 uA"
hv_channels = ["A1"]
lv_channels = ["1C01"]

[[measurements]]
type = "iv"
name = "IV"
[measurements.parameters]
voltage_end = -50
voltage_step = -10
waiting_time = 0
compliance = "10 uA"
hv_channels = ["A1"]
"#,
        )
        .unwrap();
        let layout = StripLayout::linear(1, 80.0, 1000.0);

        let (report, recorder) = run(&mut station, &mut sequence, &layout, RunOptions::default());
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(
            report.state("CV"),
            Some(NodeState::Failed(FailureKind::ComplianceTripped))
        );
        assert_eq!(report.state("IV"), Some(NodeState::Completed));
        assert_eq!(recorder.rows_for("CV").len(), 41);
        assert_eq!(recorder.rows_for("IV").len(), 6);

        let history = rig.bias.history();
        let trip = history.iter().position(|&v| v == -200.0).unwrap();
        let descent: Vec<f64> = (1..=40).map(|i| -200.0 + 5.0 * i as f64).collect();
        assert_eq!(&history[trip + 1..trip + 41], descent.as_slice());
    }

    #[test]
    fn test_humidity_excursion_suspends_istrip() {
        let rig = SimRig::new();
        let mut station = tuned(rig.builder());
        let mut sequence = Sequence::from_toml_str(STRIPSCAN).unwrap();
        sequence.nodes[0].children[0].interval = 1;
        let layout = StripLayout::linear(3, 80.0, 1000.0);
        rig.environment.script_humidity([70.0, 65.0]);

        let (report, recorder) = run(&mut station, &mut sequence, &layout, RunOptions::default());
        assert_eq!(report.state("Stripscan/Istrip"), Some(NodeState::Completed));
        assert_eq!(rig.environment.pending_script(), 0);
        assert!(rig.environment.reads() >= 5);
        assert_eq!(recorder.rows.len(), 3);
        assert!(recorder.rows.iter().all(|r| r.humidity == Some(30.0)));
    }

    #[test]
    fn test_auto_disable_skips_on_second_run() {
        let rig = SimRig::new();
        let mut station = tuned(rig.builder());
        let mut sequence = Sequence::from_toml_str(STRIPSCAN).unwrap();
        sequence.nodes[0].auto_disable = true;
        let layout = StripLayout::linear(4, 80.0, 1000.0);

        let (first, _) = run(&mut station, &mut sequence, &layout, RunOptions::default());
        assert_eq!(first.state("Stripscan"), Some(NodeState::Completed));
        assert!(!sequence.nodes[0].enabled);

        let (second, recorder) = run(&mut station, &mut sequence, &layout, RunOptions::default());
        assert_eq!(second.state("Stripscan"), Some(NodeState::Skipped));
        assert_eq!(second.state("Stripscan/Istrip"), Some(NodeState::Skipped));
        assert!(recorder.rows.is_empty());
    }

    #[test]
    fn test_remeasure_then_recontact_with_offset() {
        let rig = SimRig::new();
        rig.elm.set_current(5e-9);
        let mut station = tuned(rig.builder());
        let mut sequence = Sequence::from_toml_str(STRIPSCAN).unwrap();
        let layout = StripLayout::linear(1, 80.0, 1000.0);
        let options = RunOptions {
            remeasure_count: 1,
            recontact_count: 1,
            ..RunOptions::default()
        };

        let (report, recorder) = run(&mut station, &mut sequence, &layout, options);
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(recorder.rows.len(), 4);
        assert!(recorder.rows.iter().all(|r| r.tolerance_ok == Some(false)));
        assert_eq!(report.statistics.remeasure_total(), 2);
        assert_eq!(report.statistics.recontact_total(), 1);

        let istrip = report.node("Stripscan/Istrip").unwrap();
        assert_eq!(
            istrip.state,
            NodeState::Failed(FailureKind::ToleranceOutOfRange)
        );
        assert_eq!(istrip.failures.len(), 1);
        assert_eq!(report.state("Stripscan"), Some(NodeState::Completed));

        assert!(rig.table.moves().iter().any(|p| p.x == 1005.0 && p.z == 1000.0));
    }

    #[test]
    fn test_hardware_fault_excludes_leaf_for_remaining_strips() {
        let rig = SimRig::new();
        let mut station = tuned(rig.builder());
        let mut sequence = Sequence::from_toml_str(&format!(
            "{STRIPSCAN}\n{}",
            r#"
[[measurements.strip_measurements]]
type = "idiel"
name = "Idiel"
[measurements.strip_measurements.parameters]
lv_channels = ["2C05"]
"#
        ))
        .unwrap();
        sequence.nodes[0].children[0].interval = 1;
        let layout = StripLayout::linear(3, 80.0, 1000.0);
        rig.smu.set_fail_reads(true);

        let (report, recorder) = run(&mut station, &mut sequence, &layout, RunOptions::default());
        assert_eq!(report.outcome, RunOutcome::Completed);
        let idiel = report.node("Stripscan/Idiel").unwrap();
        assert_eq!(idiel.state, NodeState::Failed(FailureKind::InstrumentError));
        assert_eq!(idiel.failures.len(), 1);
        assert_eq!(recorder.rows_for("Stripscan/Istrip").len(), 3);
    }

    #[test]
    fn test_motion_failure_aborts_run() {
        let rig = SimRig::new();
        rig.table.set_stuck(true);
        let mut station = tuned(rig.builder());
        let mut sequence = Sequence::from_toml_str(&format!(
            "{STRIPSCAN}\n{}",
            r#"
[[measurements]]
type = "iv"
name = "IV"
[measurements.parameters]
voltage_end = -10
voltage_step = -10
waiting_time = 0
compliance = "1 uA"
"#
        ))
        .unwrap();
        let layout = StripLayout::linear(2, 80.0, 1000.0);

        let (report, recorder) = run(&mut station, &mut sequence, &layout, RunOptions::default());
        assert_eq!(report.outcome, RunOutcome::Aborted);
        let stripscan = report.node("Stripscan").unwrap();
        assert_eq!(stripscan.state, NodeState::Aborted);
        assert_eq!(stripscan.failures.len(), 1);
        assert_eq!(stripscan.failures[0].kind, FailureKind::MotionBusy);
        assert_eq!(stripscan.failures[0].strip.as_deref(), Some("P1"));
        assert_eq!(report.state("IV"), Some(NodeState::Pending));
        assert!(recorder.rows.is_empty());
        assert_eq!(rig.bias.voltage(), 0.0);
        assert!(!rig.bias.is_output_on());
    }

    struct AbortAfterFirstRow {
        rows: Vec<Row>,
        handle: RunHandle,
    }

    impl Recorder for AbortAfterFirstRow {
        fn record(&mut self, row: Row) -> Result<()> {
            self.rows.push(row);
            self.handle.abort();
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_abort_marks_active_nodes_and_reaches_safe_state() {
        let rig = SimRig::new();
        let mut station = tuned(rig.builder());
        let mut sequence = Sequence::from_toml_str(STRIPSCAN).unwrap();
        sequence.nodes[0].children[0].interval = 1;
        let layout = StripLayout::linear(5, 80.0, 1000.0);

        let (handle, mut control) = RunControl::new();
        let mut recorder = AbortAfterFirstRow {
            rows: Vec::new(),
            handle,
        };
        let report = Executor::new(
            &mut station,
            &mut recorder,
            &mut control,
            &layout,
            RunOptions::default(),
        )
        .run(&mut sequence)
        .unwrap();

        assert_eq!(report.outcome, RunOutcome::Aborted);
        assert_eq!(report.state("Stripscan"), Some(NodeState::Aborted));
        assert_eq!(report.state("Stripscan/Istrip"), Some(NodeState::Aborted));
        assert_eq!(recorder.rows.len(), 1);
        assert_eq!(rig.bias.voltage(), 0.0);
        assert!(rig.hv.closed().is_empty());
        assert!(rig.elm.zero_check());
    }

    #[test]
    fn test_second_concurrent_run_is_rejected() {
        let rig = SimRig::new();
        let mut station = tuned(rig.builder());
        let _guard = station.rig_lock().acquire().unwrap();
        let mut sequence = Sequence::from_toml_str(STRIPSCAN).unwrap();
        let layout = StripLayout::linear(4, 80.0, 1000.0);
        let (_handle, mut control) = RunControl::new();
        let mut recorder = MemoryRecorder::new();
        let result = Executor::new(
            &mut station,
            &mut recorder,
            &mut control,
            &layout,
            RunOptions::default(),
        )
        .run(&mut sequence);
        assert!(matches!(result, Err(SqcError::RigBusy)));
    }

    #[test]
    fn test_invalid_strip_expression_never_starts() {
        let rig = SimRig::new();
        let mut station = tuned(rig.builder());
        let mut sequence = Sequence::from_toml_str(STRIPSCAN).unwrap();
        sequence.nodes[0].strips = "P1-P40".to_string();
        let layout = StripLayout::linear(4, 80.0, 1000.0);
        let (_handle, mut control) = RunControl::new();
        let mut recorder = MemoryRecorder::new();
        let result = Executor::new(
            &mut station,
            &mut recorder,
            &mut control,
            &layout,
            RunOptions::default(),
        )
        .run(&mut sequence);
        assert!(matches!(result, Err(SqcError::Configuration(_))));
        assert!(rig.table.moves().is_empty());
    }

    #[test]
    fn test_open_correction_before_sequence() {
        let rig = SimRig::new();
        let _ = rig.lcr.clone().with_open_capacitance(5e-12);
        let mut station = tuned(rig.builder());
        let mut sequence = Sequence::from_toml_str(
            r#"
[[measurements]]
type = "stripscan"
name = "Stripscan"
[measurements.parameters]
bias_voltage = -100
bias_compliance = "1 uA"
waiting_time = 0
hv_channels = ["A1"]

[[measurements.strip_measurements]]
type = "cac"
name = "Cac"
[measurements.strip_measurements.parameters]
lv_channels = ["3C05"]
"#,
        )
        .unwrap();
        let layout = StripLayout::linear(2, 80.0, 1000.0);
        let (_handle, mut control) = RunControl::new();
        let mut recorder = MemoryRecorder::new();
        let mut executor = Executor::new(
            &mut station,
            &mut recorder,
            &mut control,
            &layout,
            RunOptions::default(),
        );
        executor.run(&mut sequence).unwrap();
        let correction = executor.context().open_corrections["Stripscan/Cac"];
        assert!((correction - 55e-12).abs() < 1e-18);
        drop(executor);

        assert_eq!(recorder.rows.len(), 2);
        for row in &recorder.rows {
            assert!(row.get_f64("cac_cp").unwrap().abs() < 1e-18);
        }
    }
}
