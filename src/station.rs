use log::{info, warn};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::error::{Result, SqcError};
use crate::instrument::{
    Electrometer, EnvironmentBox, LcrMeter, NeedleDrive, SourceMeter, SwitchMatrix, TableDrive,
};
use crate::interlock::{EnvironmentBounds, EnvironmentMonitor};
use crate::motion::{MotionController, MotionSettings};
use crate::ramp::RampEngine;
use crate::switching::Switchboard;

/// Exclusive claim on the rig; a second concurrent run fails with `RigBusy`
#[derive(Debug, Clone, Default)]
pub struct RigLock {
    busy: Arc<AtomicBool>,
}

impl RigLock {
    pub fn acquire(&self) -> Result<RunGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SqcError::RigBusy)?;
        Ok(RunGuard {
            busy: self.busy.clone(),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Released when dropped
#[derive(Debug)]
pub struct RunGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Builder for assembling a [`Station`] from instrument implementations
#[derive(Default)]
pub struct StationBuilder {
    bias: Option<Box<dyn SourceMeter>>,
    smu: Option<Box<dyn SourceMeter>>,
    elm: Option<Box<dyn Electrometer>>,
    lcr: Option<Box<dyn LcrMeter>>,
    hv: Option<Box<dyn SwitchMatrix>>,
    lv: Option<Box<dyn SwitchMatrix>>,
    environment: Option<Box<dyn EnvironmentBox>>,
    table: Option<Box<dyn TableDrive>>,
    needles: Option<Box<dyn NeedleDrive>>,
    bounds: EnvironmentBounds,
    interlock_backoff: Option<Duration>,
    interlock_max_wait: Option<Duration>,
    motion: MotionSettings,
    recover_settle: Option<Duration>,
    lock: Option<RigLock>,
}

impl StationBuilder {
    pub fn bias(mut self, bias: Box<dyn SourceMeter>) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn smu(mut self, smu: Box<dyn SourceMeter>) -> Self {
        self.smu = Some(smu);
        self
    }

    pub fn electrometer(mut self, elm: Box<dyn Electrometer>) -> Self {
        self.elm = Some(elm);
        self
    }

    pub fn lcr(mut self, lcr: Box<dyn LcrMeter>) -> Self {
        self.lcr = Some(lcr);
        self
    }

    pub fn hv_matrix(mut self, hv: Box<dyn SwitchMatrix>) -> Self {
        self.hv = Some(hv);
        self
    }

    pub fn lv_matrix(mut self, lv: Box<dyn SwitchMatrix>) -> Self {
        self.lv = Some(lv);
        self
    }

    pub fn environment(mut self, environment: Box<dyn EnvironmentBox>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn table(mut self, table: Box<dyn TableDrive>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn needles(mut self, needles: Box<dyn NeedleDrive>) -> Self {
        self.needles = Some(needles);
        self
    }

    pub fn environment_bounds(mut self, bounds: EnvironmentBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn interlock_timing(mut self, backoff: Duration, max_wait: Duration) -> Self {
        self.interlock_backoff = Some(backoff);
        self.interlock_max_wait = Some(max_wait);
        self
    }

    pub fn motion_settings(mut self, settings: MotionSettings) -> Self {
        self.motion = settings;
        self
    }

    /// Pause between steps when returning a source to zero
    pub fn recover_settle(mut self, settle: Duration) -> Self {
        self.recover_settle = Some(settle);
        self
    }

    /// Share a lock with another station handle on the same rig
    pub fn rig_lock(mut self, lock: RigLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn build(self) -> Result<Station> {
        fn required<T>(value: Option<T>, name: &str) -> Result<T> {
            value.ok_or_else(|| SqcError::Configuration(format!("station is missing the {name}")))
        }

        let mut environment = EnvironmentMonitor::new(required(self.environment, "environment box")?)
            .with_bounds(self.bounds);
        if let Some(backoff) = self.interlock_backoff {
            environment = environment.with_backoff(backoff);
        }
        if let Some(max_wait) = self.interlock_max_wait {
            environment = environment.with_max_wait(max_wait);
        }

        let mut motion = MotionController::new(required(self.table, "table")?, self.motion);
        if let Some(needles) = self.needles {
            motion = motion.with_needles(needles);
        }

        let ramp = match self.recover_settle {
            Some(settle) => RampEngine::new(settle),
            None => RampEngine::default(),
        };

        Ok(Station {
            bias: required(self.bias, "bias source")?,
            smu: required(self.smu, "source-measure unit")?,
            elm: required(self.elm, "electrometer")?,
            lcr: required(self.lcr, "LCR meter")?,
            switches: Switchboard::new(
                required(self.hv, "HV matrix")?,
                required(self.lv, "LV matrix")?,
            ),
            environment,
            motion,
            ramp,
            lock: self.lock.unwrap_or_default(),
        })
    }
}

/// Every instrument of one probe station
pub struct Station {
    pub bias: Box<dyn SourceMeter>,
    pub smu: Box<dyn SourceMeter>,
    pub elm: Box<dyn Electrometer>,
    pub lcr: Box<dyn LcrMeter>,
    pub switches: Switchboard,
    pub environment: EnvironmentMonitor,
    pub motion: MotionController,
    pub ramp: RampEngine,
    lock: RigLock,
}

impl Station {
    pub fn builder() -> StationBuilder {
        StationBuilder::default()
    }

    pub fn rig_lock(&self) -> RigLock {
        self.lock.clone()
    }

    /// Claims the rig for one run
    pub fn lock_run(&self) -> Result<RunGuard> {
        self.lock.acquire()
    }

    /// Sources at zero and off, electrometer zero check on, all switches open
    pub fn initialize(&mut self) -> Result<()> {
        info!("Initializing station");
        self.ramp.ramp_to_zero(self.smu.as_mut())?;
        self.smu.set_output(false)?;
        self.ramp.ramp_to_zero(self.bias.as_mut())?;
        self.bias.set_output(false)?;
        self.elm.set_zero_check(true)?;
        self.switches.release_all()?;
        Ok(())
    }

    /// Best-effort return to a safe state: stops motion, ramps every source
    /// to zero, disables outputs, opens all switches.
    ///
    /// Every step is attempted; the first error is returned.
    pub fn safe_state(&mut self) -> Result<()> {
        info!("Entering safe state");
        let mut first_error: Option<SqcError> = None;
        let mut note = |result: Result<()>, what: &str| {
            if let Err(err) = result {
                warn!("Safe state: failed to {what}: {err}");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        };

        note(self.motion.stop(), "stop motion");
        note(self.ramp.ramp_to_zero(self.bias.as_mut()), "ramp bias to zero");
        note(self.bias.set_output(false), "disable bias output");
        note(self.ramp.ramp_to_zero(self.smu.as_mut()), "ramp SMU to zero");
        note(self.smu.set_output(false), "disable SMU output");
        note(self.elm.set_zero_check(true), "enable electrometer zero check");
        note(self.switches.release_all(), "open switches");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
