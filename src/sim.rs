//! Simulated instruments
//!
//! Every simulator is a cheap clonable handle around shared state so tests can
//! keep a copy, hand the other to a [`Station`], and inspect the command
//! history afterwards. `sqc-run --simulate` uses the same rig.

use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
};

use crate::error::SqcError;
use crate::instrument::{
    Electrometer, EnvironmentBox, LcrMeter, NeedleDrive, SourceMeter, SwitchMatrix, TableDrive,
};
use crate::station::{Station, StationBuilder};
use crate::types::{Axis, Channel, EnvironmentReading, Position};

// === Source meter ===

#[derive(Debug)]
pub struct SourceMeterState {
    pub output: bool,
    pub voltage: f64,
    pub compliance: f64,
    /// Every programmed voltage in order
    pub history: Vec<f64>,
    /// Load resistance seen by the source
    pub load_ohm: f64,
    /// Hardware compliance trips once |V| reaches this level
    pub trip_voltage: Option<f64>,
    pub current_reads: usize,
    pub fail_reads: bool,
}

#[derive(Debug, Clone)]
pub struct SimSourceMeter {
    state: Arc<Mutex<SourceMeterState>>,
}

impl SimSourceMeter {
    pub fn new(load_ohm: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceMeterState {
                output: false,
                voltage: 0.0,
                compliance: 1e-3,
                history: Vec::new(),
                load_ohm,
                trip_voltage: None,
                current_reads: 0,
                fail_reads: false,
            })),
        }
    }

    pub fn trip_at(self, voltage: f64) -> Self {
        self.state.lock().trip_voltage = Some(voltage);
        self
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    pub fn history(&self) -> Vec<f64> {
        self.state.lock().history.clone()
    }

    pub fn voltage(&self) -> f64 {
        self.state.lock().voltage
    }

    pub fn is_output_on(&self) -> bool {
        self.state.lock().output
    }

    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }
}

impl SourceMeter for SimSourceMeter {
    fn set_output(&mut self, enabled: bool) -> Result<(), SqcError> {
        self.state.lock().output = enabled;
        Ok(())
    }

    fn output(&mut self) -> Result<bool, SqcError> {
        Ok(self.state.lock().output)
    }

    fn set_voltage(&mut self, voltage: f64) -> Result<(), SqcError> {
        let mut state = self.state.lock();
        state.voltage = voltage;
        state.history.push(voltage);
        Ok(())
    }

    fn voltage_level(&mut self) -> Result<f64, SqcError> {
        Ok(self.state.lock().voltage)
    }

    fn set_current_compliance(&mut self, compliance: f64) -> Result<(), SqcError> {
        self.state.lock().compliance = compliance;
        Ok(())
    }

    fn compliance_tripped(&mut self) -> Result<bool, SqcError> {
        let state = self.state.lock();
        Ok(state
            .trip_voltage
            .map(|trip| state.voltage.abs() >= trip.abs() - 1e-9)
            .unwrap_or(false))
    }

    fn read_current(&mut self) -> Result<f64, SqcError> {
        let mut state = self.state.lock();
        if state.fail_reads {
            return Err(SqcError::Instrument("simulated read timeout".to_string()));
        }
        state.current_reads += 1;
        if !state.output {
            return Ok(0.0);
        }
        Ok(state.voltage / state.load_ohm)
    }

    fn read_voltage(&mut self) -> Result<f64, SqcError> {
        let state = self.state.lock();
        Ok(if state.output { state.voltage } else { 0.0 })
    }
}

// === Electrometer ===

#[derive(Debug)]
pub struct ElectrometerState {
    pub zero_check: bool,
    pub current: f64,
    pub scripted: VecDeque<f64>,
    pub reads: usize,
}

#[derive(Debug, Clone)]
pub struct SimElectrometer {
    state: Arc<Mutex<ElectrometerState>>,
}

impl SimElectrometer {
    pub fn new(current: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ElectrometerState {
                zero_check: true,
                current,
                scripted: VecDeque::new(),
                reads: 0,
            })),
        }
    }

    pub fn set_current(&self, current: f64) {
        self.state.lock().current = current;
    }

    /// Values returned by the next reads, before falling back to the constant current
    pub fn script(&self, values: impl IntoIterator<Item = f64>) {
        self.state.lock().scripted.extend(values);
    }

    pub fn zero_check(&self) -> bool {
        self.state.lock().zero_check
    }

    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }
}

impl Electrometer for SimElectrometer {
    fn set_zero_check(&mut self, enabled: bool) -> Result<(), SqcError> {
        self.state.lock().zero_check = enabled;
        Ok(())
    }

    fn read_current(&mut self) -> Result<f64, SqcError> {
        let mut state = self.state.lock();
        state.reads += 1;
        if state.zero_check {
            return Ok(0.0);
        }
        let current = state.current;
        Ok(state.scripted.pop_front().unwrap_or(current))
    }
}

// === LCR meter ===

#[derive(Debug)]
pub struct LcrState {
    pub cp: f64,
    pub rp: f64,
    /// Stray capacitance added to every reading
    pub open_cp: f64,
    pub reads: usize,
    pub last_frequency: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SimLcrMeter {
    state: Arc<Mutex<LcrState>>,
}

impl SimLcrMeter {
    pub fn new(cp: f64, rp: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(LcrState {
                cp,
                rp,
                open_cp: 0.0,
                reads: 0,
                last_frequency: None,
            })),
        }
    }

    pub fn with_open_capacitance(self, open_cp: f64) -> Self {
        self.state.lock().open_cp = open_cp;
        self
    }

    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }
}

impl LcrMeter for SimLcrMeter {
    fn read_lcr(&mut self, _amplitude: f64, frequency: f64) -> Result<(f64, f64), SqcError> {
        let mut state = self.state.lock();
        state.reads += 1;
        state.last_frequency = Some(frequency);
        Ok((state.cp + state.open_cp, state.rp))
    }
}

// === Switch matrix ===

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOp {
    Open(BTreeSet<Channel>),
    Close(BTreeSet<Channel>),
    OpenAll,
}

#[derive(Debug, Default)]
pub struct SwitchState {
    pub closed: BTreeSet<Channel>,
    pub operations: Vec<SwitchOp>,
    /// Channels that silently refuse to close, for read-back tests
    pub stuck_open: BTreeSet<Channel>,
}

#[derive(Debug, Clone, Default)]
pub struct SimSwitchMatrix {
    state: Arc<Mutex<SwitchState>>,
}

impl SimSwitchMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closed(&self) -> BTreeSet<Channel> {
        self.state.lock().closed.clone()
    }

    pub fn operations(&self) -> Vec<SwitchOp> {
        self.state.lock().operations.clone()
    }

    pub fn stick_open(&self, channel: &str) {
        self.state.lock().stuck_open.insert(Channel::from(channel));
    }
}

impl SwitchMatrix for SimSwitchMatrix {
    fn closed_channels(&mut self) -> Result<BTreeSet<Channel>, SqcError> {
        Ok(self.state.lock().closed.clone())
    }

    fn open_channels(&mut self, channels: &BTreeSet<Channel>) -> Result<(), SqcError> {
        let mut state = self.state.lock();
        for channel in channels {
            state.closed.remove(channel);
        }
        state.operations.push(SwitchOp::Open(channels.clone()));
        Ok(())
    }

    fn close_channels(&mut self, channels: &BTreeSet<Channel>) -> Result<(), SqcError> {
        let mut state = self.state.lock();
        for channel in channels {
            if !state.stuck_open.contains(channel) {
                state.closed.insert(channel.clone());
            }
        }
        state.operations.push(SwitchOp::Close(channels.clone()));
        Ok(())
    }

    fn open_all(&mut self) -> Result<(), SqcError> {
        let mut state = self.state.lock();
        state.closed.clear();
        state.operations.push(SwitchOp::OpenAll);
        Ok(())
    }
}

// === Environment box ===

#[derive(Debug)]
pub struct EnvironmentState {
    pub nominal: EnvironmentReading,
    pub scripted: VecDeque<EnvironmentReading>,
    pub reads: usize,
    pub test_running: bool,
}

#[derive(Debug, Clone)]
pub struct SimEnvironmentBox {
    state: Arc<Mutex<EnvironmentState>>,
}

impl SimEnvironmentBox {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(EnvironmentState {
                nominal: EnvironmentReading {
                    temperature,
                    humidity,
                    test_running: false,
                },
                scripted: VecDeque::new(),
                reads: 0,
                test_running: false,
            })),
        }
    }

    /// Humidity values returned by the next reads before falling back to nominal
    pub fn script_humidity(&self, values: impl IntoIterator<Item = f64>) {
        let mut state = self.state.lock();
        let nominal = state.nominal;
        state
            .scripted
            .extend(values.into_iter().map(|humidity| EnvironmentReading {
                humidity,
                ..nominal
            }));
    }

    pub fn set_humidity(&self, humidity: f64) {
        self.state.lock().nominal.humidity = humidity;
    }

    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }

    pub fn pending_script(&self) -> usize {
        self.state.lock().scripted.len()
    }

    pub fn test_running(&self) -> bool {
        self.state.lock().test_running
    }
}

impl EnvironmentBox for SimEnvironmentBox {
    fn read_environment(&mut self) -> Result<EnvironmentReading, SqcError> {
        let mut state = self.state.lock();
        state.reads += 1;
        let reading = state.scripted.pop_front().unwrap_or(state.nominal);
        Ok(EnvironmentReading {
            test_running: state.test_running,
            ..reading
        })
    }

    fn set_test_running(&mut self, running: bool) -> Result<(), SqcError> {
        self.state.lock().test_running = running;
        Ok(())
    }
}

// === Table ===

#[derive(Debug)]
pub struct TableState {
    pub position: Position,
    pub calibrated: [bool; 3],
    /// Number of `is_moving` polls that report motion after each move
    pub move_polls: usize,
    pub pending_polls: usize,
    /// When set the table never reports completion
    pub stuck: bool,
    /// Offset applied to the read-back after calibrating an axis
    pub calibration_error: f64,
    pub moves: Vec<Position>,
    pub stops: usize,
}

#[derive(Debug, Clone)]
pub struct SimTable {
    state: Arc<Mutex<TableState>>,
}

fn axis_index(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
        Axis::Z => 2,
    }
}

impl SimTable {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TableState {
                position: Position::default(),
                calibrated: [true; 3],
                move_polls: 1,
                pending_polls: 0,
                stuck: false,
                calibration_error: 0.0,
                moves: Vec::new(),
                stops: 0,
            })),
        }
    }

    pub fn uncalibrated() -> Self {
        let table = Self::new();
        table.state.lock().calibrated = [false; 3];
        table
    }

    pub fn set_stuck(&self, stuck: bool) {
        self.state.lock().stuck = stuck;
    }

    pub fn set_calibration_error(&self, error: f64) {
        self.state.lock().calibration_error = error;
    }

    pub fn position(&self) -> Position {
        self.state.lock().position
    }

    pub fn moves(&self) -> Vec<Position> {
        self.state.lock().moves.clone()
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }
}

impl Default for SimTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TableDrive for SimTable {
    fn move_absolute(&mut self, position: Position) -> Result<(), SqcError> {
        let mut state = self.state.lock();
        state.position = position;
        state.moves.push(position);
        state.pending_polls = state.move_polls;
        Ok(())
    }

    fn move_relative(&mut self, delta: Position) -> Result<(), SqcError> {
        let mut state = self.state.lock();
        let target = state.position.offset(delta.x, delta.y, delta.z);
        state.position = target;
        state.moves.push(target);
        state.pending_polls = state.move_polls;
        Ok(())
    }

    fn read_position(&mut self) -> Result<Position, SqcError> {
        Ok(self.state.lock().position)
    }

    fn is_moving(&mut self) -> Result<bool, SqcError> {
        let mut state = self.state.lock();
        if state.stuck {
            return Ok(true);
        }
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn calibrate(&mut self, axis: Axis) -> Result<(), SqcError> {
        let mut state = self.state.lock();
        let error = state.calibration_error;
        state.position = state.position.with_axis(axis, error);
        state.calibrated[axis_index(axis)] = true;
        state.pending_polls = state.move_polls;
        Ok(())
    }

    fn is_calibrated(&mut self, axis: Axis) -> Result<bool, SqcError> {
        Ok(self.state.lock().calibrated[axis_index(axis)])
    }

    fn stop(&mut self) -> Result<(), SqcError> {
        let mut state = self.state.lock();
        state.stops += 1;
        state.pending_polls = 0;
        Ok(())
    }
}

// === Needles ===

#[derive(Debug, Clone, Default)]
pub struct SimNeedles {
    state: Arc<Mutex<(f64, Vec<f64>)>>,
}

impl SimNeedles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> f64 {
        self.state.lock().0
    }

    pub fn moves(&self) -> Vec<f64> {
        self.state.lock().1.clone()
    }
}

impl NeedleDrive for SimNeedles {
    fn move_to(&mut self, position: f64) -> Result<(), SqcError> {
        let mut state = self.state.lock();
        state.0 = position;
        state.1.push(position);
        Ok(())
    }

    fn read_position(&mut self) -> Result<f64, SqcError> {
        Ok(self.state.lock().0)
    }
}

/// A complete simulated probe station with handles to every instrument
#[derive(Debug, Clone)]
pub struct SimRig {
    pub bias: SimSourceMeter,
    pub smu: SimSourceMeter,
    pub elm: SimElectrometer,
    pub lcr: SimLcrMeter,
    pub hv: SimSwitchMatrix,
    pub lv: SimSwitchMatrix,
    pub environment: SimEnvironmentBox,
    pub table: SimTable,
    pub needles: SimNeedles,
}

impl SimRig {
    /// Nominal sensor: 1 GOhm bulk, 100 pA strip current, 50 pF coupling
    pub fn new() -> Self {
        Self {
            bias: SimSourceMeter::new(1e9),
            smu: SimSourceMeter::new(1.5e6),
            elm: SimElectrometer::new(100e-12),
            lcr: SimLcrMeter::new(50e-12, 1e9),
            hv: SimSwitchMatrix::new(),
            lv: SimSwitchMatrix::new(),
            environment: SimEnvironmentBox::new(21.0, 30.0),
            table: SimTable::new(),
            needles: SimNeedles::new(),
        }
    }

    /// Station builder wired to this rig's instruments
    pub fn builder(&self) -> StationBuilder {
        Station::builder()
            .bias(Box::new(self.bias.clone()))
            .smu(Box::new(self.smu.clone()))
            .electrometer(Box::new(self.elm.clone()))
            .lcr(Box::new(self.lcr.clone()))
            .hv_matrix(Box::new(self.hv.clone()))
            .lv_matrix(Box::new(self.lv.clone()))
            .environment(Box::new(self.environment.clone()))
            .table(Box::new(self.table.clone()))
            .needles(Box::new(self.needles.clone()))
    }
}

impl Default for SimRig {
    fn default() -> Self {
        Self::new()
    }
}
