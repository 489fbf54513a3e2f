//! The control unit, which tracks where in the micro-programs execution is.

use super::instr::InstrId;

/// The micro-program the control unit is executing.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Current {
    /// The fetch sequence.
    #[default]
    Fetch,
    /// The micro-program of a decoded machine instruction.
    Instr(InstrId)
}

/// A position in a micro-program.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Cursor {
    /// The micro-program.
    pub current: Current,
    /// The index of the next microinstruction to execute in that micro-program.
    pub micro_index: usize
}
impl Cursor {
    /// The start of a machine cycle: the first microinstruction of the fetch sequence.
    pub const CYCLE_START: Self = Self { current: Current::Fetch, micro_index: 0 };
}

/// The state of the machine, as reported by the control unit.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum RunState {
    /// Not executing.
    #[default]
    Idle,
    /// Executing the fetch sequence.
    Fetching,
    /// Executing the micro-program of a decoded instruction.
    Executing,
    /// Stopped because a halt bit was set.
    Halted,
    /// Stopped because a memory access touched a breakpoint.
    Broken,
    /// Stopped because a stop was requested.
    Aborted,
    /// Stopped because a microinstruction raised an error.
    ExceptionThrown
}
impl RunState {
    /// Whether this state is one a run can stop in (as opposed to a transient state).
    pub fn is_stopped(self) -> bool {
        !matches!(self, RunState::Fetching | RunState::Executing)
    }
}
impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle            => "idle",
            RunState::Fetching        => "fetching",
            RunState::Executing       => "executing",
            RunState::Halted          => "halted",
            RunState::Broken          => "stopped at breakpoint",
            RunState::Aborted         => "aborted",
            RunState::ExceptionThrown => "exception thrown",
        };
        f.write_str(name)
    }
}

/// How far an execution request runs.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum RunMode {
    /// Runs machine cycles until the machine halts, breaks, errors, or is stopped.
    RunAndFireCycles,
    /// Runs until the current machine instruction completes
    /// (running the fetch sequence first, if at the start of a cycle).
    StepByInstr,
    /// Runs one microinstruction.
    StepByMicro
}

/// A notification of a change in the control unit's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEvent {
    /// The new state.
    pub state: RunState,
    /// The name of the micro-program the cursor is in.
    pub instruction: String,
    /// The index of the next microinstruction to execute.
    pub micro_index: usize,
    /// The error message, if the state is [`RunState::ExceptionThrown`].
    pub error: Option<String>
}

/// The control unit of a machine.
#[derive(Debug, Default, Clone)]
pub struct ControlUnit {
    pub(crate) cursor: Cursor,
    pub(crate) state: RunState
}
impl ControlUnit {
    /// The position of the next microinstruction to execute.
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }
    /// The micro-program being executed.
    pub fn current(&self) -> Current {
        self.cursor.current
    }
    /// The index of the next microinstruction to execute.
    pub fn micro_index(&self) -> usize {
        self.cursor.micro_index
    }
    /// The state of the machine.
    pub fn state(&self) -> RunState {
        self.state
    }
    /// Whether the next microinstruction is the first of the fetch sequence.
    pub fn at_cycle_start(&self) -> bool {
        self.cursor == Cursor::CYCLE_START
    }

    /// Returns to the start of the fetch sequence in the idle state.
    pub fn reset(&mut self) {
        self.cursor = Cursor::CYCLE_START;
        self.state = RunState::Idle;
    }
}
