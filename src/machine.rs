//! Executing machine instructions on a user-defined machine.
//!
//! This module consists of:
//! - [`Machine`]: The struct that owns a machine's hardware and programs, and executes them.
//! - [`MachineBuilder`]: The builder (and validator) that creates machines.
//! - [`hw`]: The hardware modules (registers, register arrays, RAMs, condition bits).
//! - [`instr`]: Machine instructions and their fields.
//! - [`micro`]: Microinstructions, the primitive operations instructions are made of.
//! - [`control`]: The control unit and the states and modes of execution.
//! - [`backup`]: The history used to undo execution.
//! - [`io`]: IO channels.
//! - [`observer`]: Tracking of which modules changed during execution.
//! - [`runner`]: Running a machine on a worker thread.
//!
//! # Execution
//!
//! A machine cycle runs the fetch sequence (which typically reads the next instruction
//! into an instruction register and ends with a `Decode` microinstruction),
//! then the micro-program of the decoded instruction. When the micro-program ends
//! (or an `End` microinstruction runs), the next cycle begins.
//!
//! [`Machine::execute`] runs in one of three [`RunMode`]s:
//! - [`RunMode::RunAndFireCycles`]: until the machine halts, breaks, errors, or is stopped,
//! - [`RunMode::StepByInstr`]: until the current machine instruction completes,
//! - [`RunMode::StepByMicro`]: a single microinstruction.
//!
//! ```
//! use cpusim_engine::machine::{MachineBuilder, RunMode, RunState};
//! use cpusim_engine::machine::hw::{ConditionBit, Register};
//! use cpusim_engine::machine::micro::{Micro, MicroOp};
//!
//! let mut b = MachineBuilder::new();
//! let count = b.add_register(Register::new("count", 4));
//! let status = b.add_register(Register::new("status", 1));
//! // overflowing halts the machine
//! let overflow = b.add_condition_bit(ConditionBit::new("overflow", status, 0).with_halt(true));
//!
//! let inc = b.add_micro(Micro::new("count++", MicroOp::Increment {
//!     register: count.into(), delta: 1, overflow_bit: Some(overflow), carry_bit: None
//! }));
//! b.set_fetch_sequence(vec![inc]);
//! let mut machine = b.build().unwrap();
//!
//! assert_eq!(machine.execute(RunMode::RunAndFireCycles), Ok(RunState::Halted));
//! assert_eq!(machine.hw()[count].value(), -8);
//! assert!(machine.hw().condition_bit(overflow));
//! ```
//!
//! ## Errors and breaks
//!
//! A microinstruction that cannot complete (e.g., a division by zero)
//! stops the run with an [`ExecErr`]. Writes made before the failure remain,
//! and the control unit points at the failing microinstruction.
//!
//! A memory access that touches a RAM cell with a breakpoint completes,
//! and then stops the run in the [`RunState::Broken`] state.
//! Running again resumes after the access.
//!
//! ## Backing up
//!
//! While [`MachineFlags::record_history`] is set, every microinstruction records
//! what it changed. [`Machine::backup_one_micro_instruction`],
//! [`Machine::backup_one_machine_instruction`], and [`Machine::backup_all_the_way`]
//! undo those changes.

pub mod backup;
mod builder;
pub mod control;
pub mod hw;
pub mod instr;
pub mod io;
pub mod micro;
pub mod observer;
pub mod runner;

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel as cbc;

use crate::bits::Indexing;
use self::backup::{BackupManager, Change, Frame};
use self::control::{ControlUnit, Current, Cursor};
use self::hw::{Hardware, RamId};
use self::instr::{Field, FieldId, InstrId, MachineInstruction};
use self::io::{Channels, InputErr};
use self::micro::{ExecCtx, Micro, MicroId, ModuleRef};
use self::observer::{AccessSet, ChangeObserver};

pub use self::builder::{MachineBuilder, ValidationErr};
pub use self::control::{RunMode, RunState, StateEvent};
pub use self::runner::MachineRunner;

/// The reason a microinstruction failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecErrKind {
    /// A division had a divisor of 0.
    DivideByZero,
    /// An array index was past the end of the array.
    IndexOutOfRange {
        /// The index.
        index: u64,
        /// The length of the array.
        len: usize
    },
    /// A read-only register (named here) was written to.
    ReadOnly(String),
    /// A memory access fell (partly) outside of a RAM.
    AddressOutOfRange {
        /// The name of the RAM.
        ram: String,
        /// The address accessed.
        address: i64
    },
    /// No instruction's opcode matched the instruction register (whose bits are given here).
    NoMatchingOpcode(u64),
    /// A test or branch moved the cursor before the start of the micro-program.
    MicroIndexOutOfRange(isize),
    /// An IO channel could not supply input.
    Io(InputErr),
    /// An input value does not fit in the buffer register.
    InputDoesNotFit {
        /// The value read.
        value: i64,
        /// The width of the buffer register.
        width: u32
    },
    /// A value is not a valid character for the IO microinstruction's type.
    InvalidChar(i64),
}
impl std::fmt::Display for ExecErrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecErrKind::DivideByZero => f.write_str("division by zero"),
            ExecErrKind::IndexOutOfRange { index, len } => write!(f, "index {index} is out of range for an array of length {len}"),
            ExecErrKind::ReadOnly(name) => write!(f, "register {name} is read-only"),
            ExecErrKind::AddressOutOfRange { ram, address } => write!(f, "address {address} is out of range for {ram}"),
            ExecErrKind::NoMatchingOpcode(bits) => write!(f, "no instruction has an opcode matching {bits:#x}"),
            ExecErrKind::MicroIndexOutOfRange(index) => write!(f, "microinstruction index {index} is out of range"),
            ExecErrKind::Io(e) => write!(f, "{e}"),
            ExecErrKind::InputDoesNotFit { value, width } => write!(f, "input {value} does not fit in {width} bits"),
            ExecErrKind::InvalidChar(value) => write!(f, "{value} is not a valid character"),
        }
    }
}
impl From<InputErr> for ExecErrKind {
    fn from(value: InputErr) -> Self {
        ExecErrKind::Io(value)
    }
}

/// A fatal error raised while executing a microinstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecErr {
    /// The name of the microinstruction that failed.
    pub micro: String,
    /// What went wrong.
    pub kind: ExecErrKind
}
impl std::fmt::Display for ExecErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.micro, self.kind)
    }
}
impl std::error::Error for ExecErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ExecErrKind::Io(e) => Some(e),
            _ => None
        }
    }
}
impl crate::err::Error for ExecErr {
    fn help(&self) -> Option<Cow<str>> {
        match &self.kind {
            ExecErrKind::DivideByZero => Some("test the divisor before dividing".into()),
            ExecErrKind::IndexOutOfRange { len, .. } => Some(format!("array indices must be less than {len}").into()),
            ExecErrKind::ReadOnly(_) => None,
            ExecErrKind::AddressOutOfRange { .. } => Some("multi-cell accesses need every cell to be in range".into()),
            ExecErrKind::NoMatchingOpcode(_) => Some("the program may have run past its end into data".into()),
            ExecErrKind::MicroIndexOutOfRange(_) => Some("check the amounts of branch and test microinstructions".into()),
            ExecErrKind::Io(e) => crate::err::Error::help(e),
            ExecErrKind::InputDoesNotFit { width, .. } => Some(format!("the buffer register holds {width} bits").into()),
            ExecErrKind::InvalidChar(_) => Some("ASCII values must be between 0 and 127".into()),
        }
    }
}

/// Configuration flags for [`Machine`].
///
/// These can be modified after the machine is built with [`Machine::set_flags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineFlags {
    /// How bits are numbered within registers.
    ///
    /// This affects every bit range of every microinstruction.
    /// This is `Indexing::FromRight` by default.
    pub indexing: Indexing,

    /// Whether executed microinstructions record their changes, so they can be backed up.
    ///
    /// This is `true` by default.
    pub record_history: bool,

    /// The maximum number of executed microinstructions kept for backing up.
    ///
    /// This is `None` (no limit) by default.
    pub history_limit: Option<usize>,

    /// Whether input read by IO microinstructions is written back to the channel it came from.
    ///
    /// This is `false` by default.
    pub io_echo: bool
}
impl Default for MachineFlags {
    fn default() -> Self {
        Self {
            indexing: Indexing::FromRight,
            record_history: true,
            history_limit: None,
            io_echo: false
        }
    }
}

/// A handle that can stop a running machine from another thread.
///
/// The stop is observed between microinstructions, and the run ends in [`RunState::Aborted`].
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);
impl StopHandle {
    /// Requests that the current run stop.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
    /// Whether a stop has been requested since the current run began.
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Progress of one call to [`Machine::execute`] (or one run on a [`MachineRunner`]).
#[derive(Debug)]
pub(crate) struct Run {
    mode: RunMode,
    micros: u64,
    limit: Option<u64>
}

/// A user-defined machine, ready to execute.
#[derive(Debug)]
pub struct Machine {
    hw: Hardware,
    fields: Vec<Field>,
    micros: Vec<Micro>,
    instrs: Vec<MachineInstruction>,
    fetch: MachineInstruction,
    channels: Channels,
    control: ControlUnit,
    backup: BackupManager,
    flags: MachineFlags,

    /// Tracks changes in machine state since the last execution began.
    pub observer: ChangeObserver,

    stop: Arc<AtomicBool>,
    listeners: Vec<cbc::Sender<StateEvent>>,
    micros_run: u64,
    instructions_run: u64
}
impl Machine {
    pub(crate) fn from_parts(
        hw: Hardware,
        fields: Vec<Field>,
        micros: Vec<Micro>,
        instrs: Vec<MachineInstruction>,
        fetch: MachineInstruction,
        channels: Channels,
        flags: MachineFlags
    ) -> Self {
        Self {
            hw,
            fields,
            micros,
            instrs,
            fetch,
            channels,
            control: ControlUnit::default(),
            backup: BackupManager::new(flags.history_limit),
            flags,
            observer: ChangeObserver::new(),
            stop: Arc::new(AtomicBool::new(false)),
            listeners: vec![],
            micros_run: 0,
            instructions_run: 0
        }
    }

    /// The hardware of this machine.
    pub fn hw(&self) -> &Hardware {
        &self.hw
    }
    /// Mutable access to the hardware of this machine.
    ///
    /// Writes made here are not checked and not recorded for backup.
    pub fn hw_mut(&mut self) -> &mut Hardware {
        &mut self.hw
    }
    /// The control unit of this machine.
    pub fn control_unit(&self) -> &ControlUnit {
        &self.control
    }
    /// The backup history of this machine.
    pub fn backup_manager(&self) -> &BackupManager {
        &self.backup
    }
    /// The IO channels of this machine.
    pub fn channels(&self) -> &Channels {
        &self.channels
    }
    /// Mutable access to the IO channels of this machine.
    pub fn channels_mut(&mut self) -> &mut Channels {
        &mut self.channels
    }
    /// The configuration flags of this machine.
    pub fn flags(&self) -> &MachineFlags {
        &self.flags
    }
    /// Replaces the configuration flags of this machine.
    pub fn set_flags(&mut self, flags: MachineFlags) {
        self.hw.indexing = flags.indexing;
        self.backup.set_limit(flags.history_limit);
        if !flags.record_history {
            self.backup.clear();
        }
        self.flags = flags;
    }

    /// All instruction fields.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
    /// Gets an instruction field.
    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id.0]
    }
    /// All microinstructions.
    pub fn micros(&self) -> impl Iterator<Item=(MicroId, &Micro)> {
        self.micros.iter().enumerate().map(|(i, m)| (MicroId(i), m))
    }
    /// Gets a microinstruction.
    pub fn micro(&self, id: MicroId) -> &Micro {
        &self.micros[id.0]
    }
    /// All machine instructions.
    pub fn instructions(&self) -> impl Iterator<Item=(InstrId, &MachineInstruction)> {
        self.instrs.iter().enumerate().map(|(i, m)| (InstrId(i), m))
    }
    /// Gets a machine instruction.
    pub fn instruction(&self, id: InstrId) -> &MachineInstruction {
        &self.instrs[id.0]
    }
    /// Looks up a machine instruction by name.
    pub fn instruction_by_name(&self, name: &str) -> Option<InstrId> {
        self.instrs.iter().position(|i| i.name() == name).map(InstrId)
    }
    /// The fetch sequence.
    pub fn fetch_sequence(&self) -> &MachineInstruction {
        &self.fetch
    }
    /// The micro-program the control unit is in (the fetch sequence or a decoded instruction).
    pub fn current_instruction(&self) -> &MachineInstruction {
        match self.control.cursor.current {
            Current::Fetch => &self.fetch,
            Current::Instr(id) => &self.instrs[id.0],
        }
    }
    /// The number of microinstructions executed since the machine was built.
    ///
    /// Backing up does not decrease this count.
    pub fn micros_run(&self) -> u64 {
        self.micros_run
    }
    /// The number of machine instructions completed since the machine was built.
    pub fn instructions_run(&self) -> u64 {
        self.instructions_run
    }

    /// Finds the instruction whose opcode matches the left-most bits of `ir`,
    /// a value of `ir_width` bits.
    pub fn decode(&self, ir: i64, ir_width: u32) -> Option<InstrId> {
        self.instrs.iter()
            .position(|instr| instr.matches(&self.fields, ir, ir_width))
            .map(InstrId)
    }
    /// All microinstructions that refer to the given module.
    pub fn micros_using(&self, module: impl Into<ModuleRef>) -> Vec<MicroId> {
        let module = module.into();
        self.micros()
            .filter(|(_, m)| m.uses(module))
            .map(|(id, _)| id)
            .collect()
    }
    /// Replaces the name and operands of a microinstruction with those of `micro`,
    /// which must be of the same kind and must be valid for this machine.
    pub fn update_micro(&mut self, id: MicroId, micro: Micro) -> Result<(), ValidationErr> {
        micro.validate(&self.hw, &self.channels)?;
        let duplicate = self.micros().any(|(other, m)| other != id && m.name() == micro.name());
        if duplicate {
            return Err(ValidationErr::DuplicateName { kind: "microinstruction", name: micro.name().to_string() });
        }
        match self.micros.get_mut(id.0) {
            Some(target) => micro.copy_data_to(target),
            None => Err(ValidationErr::DanglingHandle { owner: micro.name().to_string() })
        }
    }

    /// Writes words into consecutive RAM locations, starting at `start`.
    ///
    /// Each word is `width` bits wide and occupies `width / cell_size` cells (big-endian).
    pub fn load_words(&mut self, ram: RamId, start: usize, words: &[i64], width: u32) -> Result<(), ExecErrKind> {
        let ram = &mut self.hw[ram];
        let step = ram.cells_spanned(width);
        for (i, &word) in words.iter().enumerate() {
            let addr = start + i * step;
            ram.set_data(addr, word, width)
                .ok_or_else(|| ExecErrKind::AddressOutOfRange { ram: ram.name().to_string(), address: addr as i64 })?;
        }
        Ok(())
    }

    /// Creates a handle which can stop this machine from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }
    /// Subscribes to state changes.
    ///
    /// Every change of [`RunState`] is reported, in every mode. During a run, the machine
    /// alternates between [`RunState::Fetching`] and [`RunState::Executing`], and each
    /// event names the micro-program just entered (the fetch sequence or the decoded instruction).
    pub fn subscribe(&mut self) -> cbc::Receiver<StateEvent> {
        let (tx, rx) = cbc::unbounded();
        self.listeners.push(tx);
        rx
    }

    fn publish(&mut self, error: Option<String>) {
        if self.listeners.is_empty() { return };

        let event = StateEvent {
            state: self.control.state,
            instruction: self.current_instruction().name().to_string(),
            micro_index: self.control.cursor.micro_index,
            error
        };
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
    fn enter(&mut self, state: RunState) {
        if self.control.state != state {
            self.control.state = state;
            tracing::debug!(%state, instruction = self.current_instruction().name(), "state changed");
            self.publish(None);
        }
    }
    fn finish(&mut self, state: RunState) -> RunState {
        self.control.state = state;
        tracing::debug!(%state, micros_run = self.micros_run, "run stopped");
        self.publish(None);
        state
    }

    /// Returns the control unit to the start of the fetch sequence and clears the backup history.
    pub fn reset(&mut self) {
        self.control.reset();
        self.backup.clear();
        self.observer.clear();
        self.publish(None);
    }
    /// Restores every register to its initial value and zeroes every RAM cell.
    ///
    /// Breakpoints are kept. The backup history is cleared.
    pub fn clear_hardware(&mut self) {
        self.hw.clear();
        self.backup.clear();
        self.observer.clear();
    }
    /// Resets every IO channel.
    pub fn reset_all_channels(&mut self) {
        self.channels.reset_all();
    }

    fn micros_of(&self, current: Current) -> &[MicroId] {
        match current {
            Current::Fetch => self.fetch.micros(),
            Current::Instr(id) => self.instrs[id.0].micros(),
        }
    }
    /// Whether the cursor has reached the end of a machine cycle.
    fn cycle_done(&self) -> bool {
        let cursor = self.control.cursor;
        cursor == Cursor::CYCLE_START || cursor.micro_index >= self.micros_of(cursor.current).len()
    }
    /// If the cursor has run off the end of its micro-program, moves it to the start of the next cycle.
    fn settle_cursor(&mut self) {
        let cursor = self.control.cursor;
        if cursor.micro_index >= self.micros_of(cursor.current).len() {
            if let Current::Instr(_) = cursor.current {
                self.instructions_run += 1;
            }
            self.control.cursor = Cursor::CYCLE_START;
        }
    }

    /// Executes the microinstruction under the cursor.
    ///
    /// Returns whether a breakpoint was hit.
    fn step_micro(&mut self) -> Result<bool, ExecErr> {
        let cursor = self.control.cursor;
        let Some(&micro_id) = self.micros_of(cursor.current).get(cursor.micro_index) else {
            return Ok(false);
        };

        let Machine { hw, fields, micros, instrs, channels, control, backup, flags, observer, micros_run, instructions_run, .. } = self;
        let micro = &micros[micro_id.0];
        let changes = match flags.record_history {
            true  => backup.begin(cursor),
            false => None
        };

        tracing::trace!(micro = micro.name(), index = cursor.micro_index, "executing microinstruction");
        let mut cx = ExecCtx {
            hw,
            fields,
            instrs,
            channels,
            observer,
            changes,
            cursor: Cursor { micro_index: cursor.micro_index + 1, ..cursor },
            echo: flags.io_echo,
            break_hit: false
        };
        let result = micro.execute(&mut cx);
        let (next, break_hit) = (cx.cursor, cx.break_hit);

        match result {
            Ok(()) => {
                control.cursor = next;
                *micros_run += 1;
                if matches!(cursor.current, Current::Instr(_)) && next == Cursor::CYCLE_START {
                    *instructions_run += 1;
                }
                Ok(break_hit)
            },
            Err(kind) => {
                // the cursor stays on the failing microinstruction
                backup.discard_if_empty();
                Err(ExecErr { micro: micro.name().to_string(), kind })
            }
        }
    }

    pub(crate) fn begin_run(&mut self, mode: RunMode, limit: Option<u64>) -> Run {
        self.observer.clear();
        self.stop.store(false, Ordering::Relaxed);
        tracing::debug!(?mode, ?limit, "starting run");
        Run { mode, micros: 0, limit }
    }

    /// Advances a run by one microinstruction.
    ///
    /// Returns the result of the run once it stops.
    pub(crate) fn advance(&mut self, run: &mut Run) -> Option<Result<RunState, ExecErr>> {
        if self.stop.load(Ordering::Relaxed) {
            return Some(Ok(self.finish(RunState::Aborted)));
        }
        if run.micros == 0 && self.hw.halt_bit_set() {
            tracing::info!("machine is halted");
            return Some(Ok(self.finish(RunState::Halted)));
        }
        if run.limit.is_some_and(|limit| run.micros >= limit) {
            return Some(Ok(self.finish(RunState::Idle)));
        }

        self.settle_cursor();
        let state = match self.control.cursor.current {
            Current::Fetch => RunState::Fetching,
            Current::Instr(_) => RunState::Executing,
        };
        self.enter(state);

        match self.step_micro() {
            Err(e) => {
                tracing::warn!(micro = %e.micro, error = %e.kind, "execution error");
                self.control.state = RunState::ExceptionThrown;
                self.publish(Some(e.to_string()));
                Some(Err(e))
            },
            Ok(break_hit) => {
                run.micros += 1;
                if self.hw.halt_bit_set() {
                    tracing::info!(instruction = self.current_instruction().name(), "halt bit set");
                    return Some(Ok(self.finish(RunState::Halted)));
                }
                if break_hit {
                    tracing::info!(instruction = self.current_instruction().name(), "breakpoint hit");
                    return Some(Ok(self.finish(RunState::Broken)));
                }

                match run.mode {
                    RunMode::StepByMicro => {
                        self.settle_cursor();
                        Some(Ok(self.finish(RunState::Idle)))
                    },
                    RunMode::StepByInstr if self.cycle_done() => {
                        self.settle_cursor();
                        Some(Ok(self.finish(RunState::Idle)))
                    },
                    _ => None
                }
            }
        }
    }

    /// Executes microinstructions in the given mode.
    ///
    /// This returns the state the machine stopped in ([`RunState::Idle`] if a step completed),
    /// or the error that stopped it (in which case the state is [`RunState::ExceptionThrown`]).
    pub fn execute(&mut self, mode: RunMode) -> Result<RunState, ExecErr> {
        let mut run = self.begin_run(mode, None);
        loop {
            if let Some(result) = self.advance(&mut run) {
                return result;
            }
        }
    }
    /// Runs until the machine halts, breaks, errors, or is stopped.
    pub fn run(&mut self) -> Result<RunState, ExecErr> {
        self.execute(RunMode::RunAndFireCycles)
    }
    /// Runs like [`Machine::run`], but stops in [`RunState::Idle`]
    /// after at most `max_micros` microinstructions.
    pub fn run_with_limit(&mut self, max_micros: u64) -> Result<RunState, ExecErr> {
        let mut run = self.begin_run(RunMode::RunAndFireCycles, Some(max_micros));
        loop {
            if let Some(result) = self.advance(&mut run) {
                return result;
            }
        }
    }

    /// Undoes the most recent microinstruction.
    ///
    /// Returns false if there is no history.
    pub fn backup_one_micro_instruction(&mut self) -> bool {
        let Some(frame) = self.backup.pop_micro() else { return false };
        self.restore(frame);
        self.finish_backup();
        true
    }
    /// Undoes microinstructions back to the start of the most recent machine cycle.
    ///
    /// Returns false (and does nothing) if the history does not reach back to the start of a cycle.
    pub fn backup_one_machine_instruction(&mut self) -> bool {
        let frames = self.backup.pop_machine_instr();
        if frames.is_empty() { return false };

        for frame in frames {
            self.restore(frame);
        }
        self.finish_backup();
        true
    }
    /// Undoes all recorded history.
    pub fn backup_all_the_way(&mut self) {
        for frame in self.backup.pop_all() {
            self.restore(frame);
        }
        self.finish_backup();
    }

    fn restore(&mut self, frame: Frame) {
        for change in frame.changes.into_iter().rev() {
            match change {
                Change::Register { reg, old } => {
                    if let Some(r) = self.hw.reg_mut(reg) {
                        let new = r.value();
                        r.set_value(old);
                        self.observer.update_reg_accesses(reg, AccessSet::write(new, old));
                    }
                },
                Change::Ram { ram, addr, old } => {
                    let ram_mod = &mut self.hw[ram];
                    let new = ram_mod.location(addr).map_or(old, |loc| loc.value());
                    ram_mod.set_data(addr, old, ram_mod.cell_size());
                    self.observer.update_mem_accesses(ram, addr, AccessSet::write(new, old));
                },
                Change::Input { channel, token } => self.channels.unread(channel, token),
            }
        }
        self.control.cursor = frame.cursor;
    }
    fn finish_backup(&mut self) {
        tracing::debug!(remaining = self.backup.len(), "backed up");
        self.control.state = RunState::Idle;
        self.publish(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::hw::{ConditionBit, Ram, Register, RegRef};
    use super::instr::Field;
    use super::io::BufferedChannel;
    use super::micro::{AccessDirection, ArithmeticKind, IoDirection, IoKind, MicroOp};

    struct Acc {
        machine: Machine,
        acc: RegRef,
        pc: RegRef,
        mem: RamId
    }

    /// A machine with 8-bit instructions (4-bit opcode, 4-bit address):
    /// 0 = halt, 1 = load, 2 = add, 3 = store.
    fn acc_machine(flags: MachineFlags) -> Acc {
        let mut b = MachineBuilder::with_flags(flags);
        let pc: RegRef = b.add_register(Register::new("pc", 4)).into();
        let ir: RegRef = b.add_register(Register::new("ir", 8)).into();
        let mar: RegRef = b.add_register(Register::new("mar", 4)).into();
        let mdr: RegRef = b.add_register(Register::new("mdr", 8)).into();
        let acc: RegRef = b.add_register(Register::new("acc", 8)).into();
        let status = b.add_register(Register::new("status", 2));
        let halt = b.add_condition_bit(ConditionBit::new("halt", status, 0).with_halt(true));
        let mem = b.add_ram(Ram::new("main", 16, 8));

        let fetch = [
            b.add_micro(Micro::new("ir<-m[pc]", MicroOp::MemoryAccess { direction: AccessDirection::Read, memory: mem, data: ir, address: pc })),
            b.add_micro(Micro::new("pc++", MicroOp::Increment { register: pc, delta: 1, overflow_bit: None, carry_bit: None })),
            b.add_micro(Micro::new("decode", MicroOp::Decode { ir })),
        ];
        b.set_fetch_sequence(fetch.to_vec());

        let mar_ir = b.add_micro(Micro::new("mar<-ir(4:8)", MicroOp::TransferRtoR { source: ir, src_start: 0, destination: mar, dest_start: 0, num_bits: 4 }));
        let mdr_m = b.add_micro(Micro::new("mdr<-m[mar]", MicroOp::MemoryAccess { direction: AccessDirection::Read, memory: mem, data: mdr, address: mar }));
        let m_acc = b.add_micro(Micro::new("m[mar]<-acc", MicroOp::MemoryAccess { direction: AccessDirection::Write, memory: mem, data: acc, address: mar }));
        let acc_mdr = b.add_micro(Micro::new("acc<-mdr", MicroOp::TransferRtoR { source: mdr, src_start: 0, destination: acc, dest_start: 0, num_bits: 8 }));
        let add = b.add_micro(Micro::new("acc<-acc+mdr", MicroOp::Arithmetic {
            kind: ArithmeticKind::Add, source1: acc, source2: mdr, destination: acc, overflow_bit: None, carry_bit: None
        }));
        let set_halt = b.add_micro(Micro::new("halt", MicroOp::SetCondBit { bit: halt, value: true }));
        let end = b.add_micro(Micro::new("end", MicroOp::End));

        let op = b.add_field(Field::new("op", 4));
        let addr = b.add_field(Field::new("addr", 4));
        b.add_instruction(MachineInstruction::new("halt", 0, vec![op, addr]).with_micros(vec![set_halt]));
        b.add_instruction(MachineInstruction::new("load", 1, vec![op, addr]).with_micros(vec![mar_ir, mdr_m, acc_mdr, end]));
        b.add_instruction(MachineInstruction::new("add", 2, vec![op, addr]).with_micros(vec![mar_ir, mdr_m, add]));
        b.add_instruction(MachineInstruction::new("store", 3, vec![op, addr]).with_micros(vec![mar_ir, m_acc]));

        Acc { machine: b.build().unwrap(), acc, pc, mem }
    }

    fn load_program(m: &mut Acc) {
        // load 8; add 9; store 10; halt
        m.machine.load_words(m.mem, 0, &[0x18, 0x29, 0x3A, 0x00], 8).unwrap();
        m.machine.load_words(m.mem, 8, &[5, 7], 8).unwrap();
    }
    fn value(machine: &Machine, r: RegRef) -> i64 {
        machine.hw().reg(r).map_or(0, Register::value)
    }

    #[test]
    fn test_run_program() {
        let mut m = acc_machine(Default::default());
        load_program(&mut m);

        assert_eq!(m.machine.run(), Ok(RunState::Halted));
        assert_eq!(m.machine.control_unit().state(), RunState::Halted);
        assert_eq!(value(&m.machine, m.acc), 12);
        assert_eq!(m.machine.hw()[m.mem].get_data(10, 8), Some(12));
        assert_eq!(m.machine.instructions_run(), 3);

        // halt bits are checked before anything runs
        assert_eq!(m.machine.run(), Ok(RunState::Halted));
    }

    #[test]
    fn test_step_modes() {
        let mut m = acc_machine(Default::default());
        load_program(&mut m);

        assert_eq!(m.machine.execute(RunMode::StepByMicro), Ok(RunState::Idle));
        assert_eq!(m.machine.control_unit().micro_index(), 1);
        assert_eq!(m.machine.current_instruction().name(), "Fetch sequence");

        // finishes the fetch, then the load (which ends with End)
        assert_eq!(m.machine.execute(RunMode::StepByInstr), Ok(RunState::Idle));
        assert!(m.machine.control_unit().at_cycle_start());
        assert_eq!(value(&m.machine, m.acc), 5);

        // the add runs off the end of its micro-program
        assert_eq!(m.machine.execute(RunMode::StepByInstr), Ok(RunState::Idle));
        assert!(m.machine.control_unit().at_cycle_start());
        assert_eq!(value(&m.machine, m.acc), 12);
        assert_eq!(m.machine.micros_run(), 13);
        assert_eq!(m.machine.instructions_run(), 2);
    }

    #[test]
    fn test_micro_steps_settle_at_instruction_end() {
        let mut m = acc_machine(Default::default());
        load_program(&mut m);

        // fetch, load (ends with End), fetch, then two of the add's three micros
        for _ in 0..12 {
            assert_eq!(m.machine.execute(RunMode::StepByMicro), Ok(RunState::Idle));
        }
        assert_eq!(m.machine.current_instruction().name(), "add");
        assert_eq!(m.machine.control_unit().micro_index(), 2);

        // the add's last micro returns the cursor to the start of the next cycle
        assert_eq!(m.machine.execute(RunMode::StepByMicro), Ok(RunState::Idle));
        assert!(m.machine.control_unit().at_cycle_start());
        assert_eq!(m.machine.current_instruction().name(), "Fetch sequence");
        assert_eq!(m.machine.instructions_run(), 2);
        assert_eq!(value(&m.machine, m.acc), 12);
    }

    #[test]
    fn test_run_reports_every_state() {
        let mut m = acc_machine(Default::default());
        load_program(&mut m);
        let rx = m.machine.subscribe();

        assert_eq!(m.machine.run(), Ok(RunState::Halted));
        let events: Vec<_> = rx.try_iter()
            .map(|e| (e.state, e.instruction, e.micro_index))
            .collect();

        let fetch = |name: &str| [
            (RunState::Fetching, "Fetch sequence".to_string(), 0),
            (RunState::Executing, name.to_string(), 0),
        ];
        let mut expected: Vec<_> = ["load", "add", "store", "halt"].into_iter()
            .flat_map(fetch)
            .collect();
        expected.push((RunState::Halted, "halt".to_string(), 1));
        assert_eq!(events, expected);
    }

    #[test]
    fn test_backup() {
        let mut m = acc_machine(Default::default());
        load_program(&mut m);

        m.machine.execute(RunMode::StepByInstr).unwrap();
        m.machine.execute(RunMode::StepByInstr).unwrap();
        assert_eq!(value(&m.machine, m.acc), 12);

        assert!(m.machine.backup_one_micro_instruction());
        assert_eq!(value(&m.machine, m.acc), 5);
        assert_eq!(m.machine.control_unit().micro_index(), 2);
        assert!(m.machine.backup_manager().can_backup_one_machine_instr());

        assert!(m.machine.backup_one_machine_instruction());
        assert!(m.machine.control_unit().at_cycle_start());
        assert_eq!(value(&m.machine, m.pc), 1);

        m.machine.run().unwrap();
        assert_eq!(m.machine.hw()[m.mem].get_data(10, 8), Some(12));

        m.machine.backup_all_the_way();
        assert!(m.machine.control_unit().at_cycle_start());
        assert_eq!(value(&m.machine, m.pc), 0);
        assert_eq!(value(&m.machine, m.acc), 0);
        assert_eq!(m.machine.hw()[m.mem].get_data(10, 8), Some(0));
        assert!(!m.machine.hw().halt_bit_set());
        assert!(!m.machine.backup_one_micro_instruction());
    }

    #[test]
    fn test_history_flags() {
        let flags = MachineFlags { record_history: false, ..Default::default() };
        let mut m = acc_machine(flags);
        load_program(&mut m);
        m.machine.run().unwrap();
        assert!(m.machine.backup_manager().is_empty());

        // the last three frames are in the middle of the halt's cycle
        let flags = MachineFlags { history_limit: Some(3), ..Default::default() };
        let mut m = acc_machine(flags);
        load_program(&mut m);
        m.machine.run().unwrap();
        assert_eq!(m.machine.backup_manager().len(), 3);
        assert!(!m.machine.backup_manager().can_backup_one_machine_instr());
    }

    #[test]
    fn test_error_rolls_back_cursor() {
        let mut m = acc_machine(Default::default());
        // opcode 15 matches nothing
        m.machine.load_words(m.mem, 0, &[0xF0], 8).unwrap();

        let err = m.machine.run().unwrap_err();
        assert_eq!(err.micro, "decode");
        assert_eq!(err.kind, ExecErrKind::NoMatchingOpcode(0xF0));
        assert_eq!(m.machine.control_unit().state(), RunState::ExceptionThrown);
        assert_eq!(m.machine.control_unit().micro_index(), 2);
        // the fetch's writes remain
        assert_eq!(value(&m.machine, m.pc), 1);
    }

    #[test]
    fn test_breakpoint() {
        let mut m = acc_machine(Default::default());
        load_program(&mut m);
        m.machine.hw_mut()[m.mem].set_breakpoint(10, true);

        assert_eq!(m.machine.run(), Ok(RunState::Broken));
        assert_eq!(m.machine.hw()[m.mem].get_data(10, 8), Some(12));
        assert_eq!(m.machine.run(), Ok(RunState::Halted));
    }

    #[test]
    fn test_stop_and_limit() {
        let mut m = acc_machine(Default::default());
        // jumps nowhere: every word is "load 0", so the machine never halts
        m.machine.load_words(m.mem, 0, &[0x10; 16], 8).unwrap();

        assert_eq!(m.machine.run_with_limit(100), Ok(RunState::Idle));
        assert_eq!(m.machine.micros_run(), 100);

        let rx = m.machine.subscribe();
        let mut run = m.machine.begin_run(RunMode::RunAndFireCycles, None);
        assert_eq!(m.machine.advance(&mut run), None);
        m.machine.stop_handle().request_stop();
        assert_eq!(m.machine.advance(&mut run), Some(Ok(RunState::Aborted)));

        let states: Vec<_> = rx.try_iter().map(|e| e.state).collect();
        assert_eq!(states.last(), Some(&RunState::Aborted));
    }

    #[test]
    fn test_subscribe() {
        let mut m = acc_machine(Default::default());
        load_program(&mut m);
        let rx = m.machine.subscribe();
        let dropped = m.machine.subscribe();
        drop(dropped);

        m.machine.execute(RunMode::StepByMicro).unwrap();
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.iter().map(|e| e.state).collect::<Vec<_>>(), [RunState::Fetching, RunState::Idle]);
        assert_eq!(events[1].micro_index, 1);
        assert_eq!(events[1].instruction, "Fetch sequence");
        assert_eq!(m.machine.listeners.len(), 1);
    }

    #[test]
    fn test_update_micro() {
        let mut m = acc_machine(Default::default());
        let pc_inc = m.machine.micros()
            .find(|(_, micro)| micro.name() == "pc++")
            .map(|(id, _)| id)
            .unwrap();
        assert_eq!(m.machine.micros_using(m.pc).len(), 2);

        let by_two = Micro::new("pc+=2", MicroOp::Increment { register: m.pc, delta: 2, overflow_bit: None, carry_bit: None });
        m.machine.update_micro(pc_inc, by_two).unwrap();
        assert_eq!(m.machine.micro(pc_inc).name(), "pc+=2");

        let wrong = Micro::new("x", MicroOp::End);
        assert!(m.machine.update_micro(pc_inc, wrong).is_err());
        let dup = Micro::new("decode", MicroOp::Increment { register: m.pc, delta: 2, overflow_bit: None, carry_bit: None });
        assert!(matches!(m.machine.update_micro(pc_inc, dup), Err(ValidationErr::DuplicateName { .. })));
    }

    #[test]
    fn test_clear_and_reset() {
        let mut m = acc_machine(Default::default());
        load_program(&mut m);
        m.machine.run().unwrap();

        m.machine.reset();
        assert!(m.machine.control_unit().at_cycle_start());
        assert_eq!(m.machine.control_unit().state(), RunState::Idle);
        assert!(m.machine.backup_manager().is_empty());

        m.machine.clear_hardware();
        assert_eq!(value(&m.machine, m.acc), 0);
        assert_eq!(m.machine.hw()[m.mem].get_data(0, 8), Some(0x00));
        assert_eq!(m.machine.decode(0x29, 8), m.machine.instruction_by_name("add"));
        assert_eq!(m.machine.hw().register_by_name("acc").map(RegRef::from), Some(m.acc));
    }

    #[test]
    fn test_input_replayed_after_backup() {
        let mut b = MachineBuilder::new();
        let acc: RegRef = b.add_register(Register::new("acc", 8)).into();
        let console = BufferedChannel::new();
        let channel = b.add_channel("console", console.clone());
        let read = b.add_micro(Micro::new("read", MicroOp::Io { kind: IoKind::Integer, direction: IoDirection::Input, buffer: acc, channel }));
        let write = b.add_micro(Micro::new("write", MicroOp::Io { kind: IoKind::Integer, direction: IoDirection::Output, buffer: acc, channel }));
        b.set_fetch_sequence(vec![read, write]);
        let mut machine = b.build().unwrap();
        console.push_input("5 -6");

        machine.execute(RunMode::StepByMicro).unwrap();
        assert_eq!(value(&machine, acc), 5);
        assert!(machine.backup_one_micro_instruction());
        assert_eq!(value(&machine, acc), 0);

        // the 5 is read again, not the -6
        machine.execute(RunMode::StepByInstr).unwrap();
        assert_eq!(value(&machine, acc), 5);
        machine.execute(RunMode::StepByInstr).unwrap();
        assert_eq!(value(&machine, acc), -6);
        assert_eq!(console.take_output(), "5\n-6\n");

        let err = machine.run().unwrap_err();
        assert_eq!(err.kind, ExecErrKind::Io(InputErr::Exhausted));
        assert_eq!(err.micro, "read");
    }
}
