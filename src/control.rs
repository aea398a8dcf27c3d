use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{info, warn};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::error::{Result, SqcError};

/// Commands accepted by a running sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    Pause,
    Resume,
    Abort,
}

/// Sending side of the run command channel, cheap to clone into signal handlers or other threads
#[derive(Debug, Clone)]
pub struct RunHandle {
    tx: Sender<RunCommand>,
    aborted: Arc<AtomicBool>,
}

impl RunHandle {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let _ = self.tx.send(RunCommand::Abort);
    }

    pub fn pause(&self) {
        let _ = self.tx.send(RunCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(RunCommand::Resume);
    }

    pub fn is_abort_requested(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Receiving side owned by the control thread.
///
/// All waits during a run go through [`RunControl::wait`] so that an abort
/// command is honored within one wait interval.
#[derive(Debug)]
pub struct RunControl {
    rx: Receiver<RunCommand>,
    aborted: Arc<AtomicBool>,
    paused: bool,
}

impl RunControl {
    pub fn new() -> (RunHandle, RunControl) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let aborted = Arc::new(AtomicBool::new(false));
        (
            RunHandle {
                tx,
                aborted: aborted.clone(),
            },
            RunControl {
                rx,
                aborted,
                paused: false,
            },
        )
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Clears a previous abort so the next run of the session can start
    pub fn reset(&mut self) {
        while self.rx.try_recv().is_ok() {}
        self.aborted.store(false, Ordering::SeqCst);
        self.paused = false;
    }

    fn handle(&mut self, command: RunCommand) {
        match command {
            RunCommand::Abort => {
                self.aborted.store(true, Ordering::SeqCst);
            }
            RunCommand::Pause => {
                if !self.paused {
                    info!("Pause requested");
                }
                self.paused = true;
            }
            RunCommand::Resume => {
                if self.paused {
                    info!("Resuming");
                }
                self.paused = false;
            }
        }
    }

    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(command) => self.handle(command),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Returns `Err(Aborted)` if an abort was requested, without blocking
    pub fn check_abort(&mut self) -> Result<()> {
        self.drain();
        if self.is_aborted() {
            Err(SqcError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Suspension point: blocks while paused, fails on abort
    pub fn check_point(&mut self) -> Result<()> {
        self.check_abort()?;
        if !self.paused {
            return Ok(());
        }
        info!("Run paused, waiting for resume");
        while self.paused {
            match self.rx.recv() {
                Ok(command) => self.handle(command),
                Err(_) => {
                    warn!("Command channel closed while paused, resuming");
                    self.paused = false;
                }
            }
            if self.is_aborted() {
                return Err(SqcError::Aborted);
            }
        }
        Ok(())
    }

    /// Cancellable sleep: returns early with `Err(Aborted)` when an abort arrives
    pub fn wait(&mut self, duration: Duration) -> Result<()> {
        self.check_abort()?;
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            match self.rx.recv_timeout(deadline - now) {
                Ok(command) => {
                    self.handle(command);
                    if self.is_aborted() {
                        return Err(SqcError::Aborted);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    return self.check_abort();
                }
            }
        }
    }
}
