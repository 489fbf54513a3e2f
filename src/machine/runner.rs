//! Running a machine on a worker thread.
//!
//! [`MachineRunner`] shares a [`Machine`] behind a mutex. The worker locks the machine
//! once per microinstruction, so other threads (e.g., a UI) can inspect or stop the
//! machine while it runs.
//!
//! ```
//! use cpusim_engine::machine::{MachineBuilder, MachineRunner, RunMode, RunState};
//! use cpusim_engine::machine::hw::Register;
//! use cpusim_engine::machine::micro::{Micro, MicroOp};
//!
//! let mut b = MachineBuilder::new();
//! let count = b.add_register(Register::new("count", 16));
//! let inc = b.add_micro(Micro::new("count++", MicroOp::Increment {
//!     register: count.into(), delta: 1, overflow_bit: None, carry_bit: None
//! }));
//! b.set_fetch_sequence(vec![inc]);
//!
//! // this machine never halts
//! let mut runner = MachineRunner::new(b.build().unwrap());
//! assert!(runner.start(RunMode::RunAndFireCycles));
//! runner.request_stop();
//! assert_eq!(runner.join(), Some(Ok(RunState::Aborted)));
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use super::{ExecErr, Machine, RunMode, RunState, StopHandle};

/// Locks the machine, ignoring poisoning (a panicked worker leaves the machine in a usable state).
fn lock(machine: &Mutex<Machine>) -> MutexGuard<'_, Machine> {
    machine.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs a [`Machine`] on a background thread.
///
/// Dropping the runner does not stop a run in progress.
/// Use [`MachineRunner::request_stop`] and [`MachineRunner::join`] for that.
#[derive(Debug)]
pub struct MachineRunner {
    machine: Arc<Mutex<Machine>>,
    stop: StopHandle,
    worker: Option<JoinHandle<Result<RunState, ExecErr>>>
}
impl MachineRunner {
    /// Creates a runner for a machine.
    pub fn new(machine: Machine) -> Self {
        let stop = machine.stop_handle();
        Self {
            machine: Arc::new(Mutex::new(machine)),
            stop,
            worker: None
        }
    }

    /// The shared machine.
    pub fn machine(&self) -> &Arc<Mutex<Machine>> {
        &self.machine
    }
    /// Locks the machine.
    ///
    /// While the guard is held, a run in progress waits before its next microinstruction.
    pub fn lock(&self) -> MutexGuard<'_, Machine> {
        lock(&self.machine)
    }

    /// Starts running the machine in the given mode.
    ///
    /// Returns false (and does nothing) if a run is already in progress.
    ///
    /// The result of a finished run that was never joined is discarded (and logged).
    pub fn start(&mut self, mode: RunMode) -> bool {
        if self.is_running() { return false };
        match self.join() {
            Some(Err(e)) => tracing::warn!(error = %e, "discarding unjoined run result"),
            Some(Ok(state)) => tracing::debug!(%state, "discarding unjoined run result"),
            None => {}
        }

        let machine = Arc::clone(&self.machine);
        let mut run = lock(&machine).begin_run(mode, None);
        self.worker = Some(std::thread::spawn(move || loop {
            let mut guard = lock(&machine);
            if let Some(result) = guard.advance(&mut run) {
                return result;
            }
            drop(guard);
        }));
        true
    }
    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
    /// Requests that the run in progress stop.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }
    /// Waits for the run in progress to end and returns its result.
    ///
    /// Returns `None` if no run was started since the last join.
    pub fn join(&mut self) -> Option<Result<RunState, ExecErr>> {
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(result) => Some(result),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineBuilder;
    use crate::machine::hw::{ConditionBit, Register};
    use crate::machine::micro::{Micro, MicroOp};

    #[test]
    fn test_runs_to_halt() {
        let mut b = MachineBuilder::new();
        let count = b.add_register(Register::new("count", 12));
        let status = b.add_register(Register::new("status", 1));
        let carry = b.add_condition_bit(ConditionBit::new("carry", status, 0).with_halt(true));
        let inc = b.add_micro(Micro::new("count++", MicroOp::Increment {
            register: count.into(), delta: 1, overflow_bit: None, carry_bit: Some(carry)
        }));
        b.set_fetch_sequence(vec![inc]);

        let mut runner = MachineRunner::new(b.build().unwrap());
        assert_eq!(runner.join(), None);
        assert!(runner.start(RunMode::RunAndFireCycles));
        assert_eq!(runner.join(), Some(Ok(RunState::Halted)));
        assert!(!runner.is_running());

        let machine = runner.lock();
        // carries out when wrapping from all ones to 0
        assert_eq!(machine.hw()[count].value(), 0);
        assert_eq!(machine.micros_run(), 1 << 12);
    }

    #[test]
    fn test_stop() {
        let mut b = MachineBuilder::new();
        let count = b.add_register(Register::new("count", 8));
        let inc = b.add_micro(Micro::new("count++", MicroOp::Increment {
            register: count.into(), delta: 1, overflow_bit: None, carry_bit: None
        }));
        b.set_fetch_sequence(vec![inc]);

        let mut runner = MachineRunner::new(b.build().unwrap());
        assert!(runner.start(RunMode::RunAndFireCycles));
        assert!(runner.is_running());
        assert!(!runner.start(RunMode::StepByMicro));
        runner.request_stop();

        assert_eq!(runner.join(), Some(Ok(RunState::Aborted)));
        assert_eq!(runner.lock().control_unit().state(), RunState::Aborted);

        // the stop request does not carry over to the next run
        assert!(runner.start(RunMode::StepByMicro));
        assert_eq!(runner.join(), Some(Ok(RunState::Idle)));
    }

    #[test]
    fn test_restart_discards_unjoined_result() {
        let mut b = MachineBuilder::new();
        let count = b.add_register(Register::new("count", 8));
        let inc = b.add_micro(Micro::new("count++", MicroOp::Increment {
            register: count.into(), delta: 1, overflow_bit: None, carry_bit: None
        }));
        b.set_fetch_sequence(vec![inc]);

        let mut runner = MachineRunner::new(b.build().unwrap());
        assert!(runner.start(RunMode::StepByMicro));
        while runner.is_running() {
            std::thread::yield_now();
        }

        // the first step's result is dropped, only the second is joined
        assert!(runner.start(RunMode::StepByMicro));
        assert_eq!(runner.join(), Some(Ok(RunState::Idle)));
        assert_eq!(runner.join(), None);
        assert_eq!(runner.lock().hw()[count].value(), 2);
    }
}
