pub mod config;
pub mod control;
pub mod error;
pub mod executor;
pub mod instrument;
pub mod interlock;
pub mod measurements;
pub mod motion;
pub mod ramp;
pub mod recorder;
pub mod sequence;
pub mod sim;
pub mod station;
pub mod switching;
pub mod types;
pub mod units;
pub mod utils;

pub use config::{AppConfig, load_config};
pub use control::{RunCommand, RunControl, RunHandle};
pub use error::{FailureKind, Result, SqcError};
pub use executor::{
    Executor, NodeFailure, NodeReport, NodeState, RunOptions, RunOutcome, RunReport, Statistics,
};
pub use instrument::{
    Electrometer, EnvironmentBox, LcrMeter, NeedleDrive, SourceMeter, SwitchMatrix, TableDrive,
};
pub use interlock::{EnvironmentBounds, EnvironmentMonitor, InterlockStatus, LiveMonitor, LiveStatus};
pub use motion::{MotionController, MotionSettings, MotionState};
pub use ramp::{RampEngine, RampSpec};
pub use recorder::{JsonlRecorder, MemoryRecorder, Recorder, Row};
pub use sequence::{NodeKind, Sequence, SequenceConfig, SequenceNode, StripLayout, StripPad};
pub use sim::SimRig;
pub use station::{RigLock, Station, StationBuilder};
pub use switching::{RouteRequest, Switchboard, SwitchingResolver};
pub use types::{Axis, Channel, EnvironmentReading, Matrix, Position, Role};
pub use units::{Quantity, Unit};
