//! Construction and validation of machines.
//!
//! A [`Machine`] can only be created through [`MachineBuilder::build`], which checks
//! every module, field, instruction, and microinstruction before handing the machine out.
//! Execution relies on these checks (e.g., every handle resolves, every bit range fits).

use std::borrow::Cow;
use std::collections::HashSet;

use crate::bits::MAX_WIDTH;
use super::hw::{ArrayId, CondBitId, ConditionBit, Hardware, Ram, RamId, Register, RegisterArray, RegisterId};
use super::instr::{Field, FieldId, InstrId, MachineInstruction};
use super::io::{ChannelId, Channels, IoChannel};
use super::micro::{Micro, MicroId};
use super::{Machine, MachineFlags};

/// Errors raised while validating a machine description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErr {
    /// A module or field has a width outside of 1 to 64 bits.
    InvalidWidth {
        /// The name of the module or field.
        module: String,
        /// Its width.
        width: u32
    },
    /// A register array or RAM has no elements.
    EmptyModule(String),
    /// Two items of the same kind share a name.
    DuplicateName {
        /// The kind of item (e.g., "register").
        kind: &'static str,
        /// The shared name.
        name: String
    },
    /// A handle does not refer to anything in this machine.
    DanglingHandle {
        /// The name of the item holding the handle.
        owner: String
    },
    /// A bit range is empty or does not fit in the width it indexes.
    BitRangeOutOfBounds {
        /// The name of the microinstruction.
        micro: String,
        /// The first bit of the range.
        start: u32,
        /// The number of bits in the range.
        num_bits: u32,
        /// The width the range indexes.
        width: u32
    },
    /// A shift's source and destination have different widths.
    MismatchedWidths {
        /// The name of the microinstruction.
        micro: String
    },
    /// A memory access's data register is not a whole number of RAM cells.
    DataWidthNotMultiple {
        /// The name of the microinstruction.
        micro: String,
        /// The data register's width.
        width: u32,
        /// The RAM's cell size.
        cell_size: u32
    },
    /// A constant does not fit in the bits it is stored in.
    ValueDoesNotFit {
        /// The name of the item holding the value.
        owner: String,
        /// The value.
        value: i64,
        /// The number of bits available.
        width: u32
    },
    /// An instruction has no fields, so it has no opcode.
    NoOpcodeField(String),
    /// An instruction's opcode does not fit in its opcode field.
    OpcodeDoesNotFit {
        /// The name of the instruction.
        instr: String,
        /// The opcode.
        opcode: u64,
        /// The width of the opcode field.
        width: u32
    },
    /// An instruction is wider than 64 bits.
    InstructionTooWide {
        /// The name of the instruction.
        instr: String,
        /// Its total width.
        width: u32
    },
    /// The fetch sequence has no microinstructions.
    EmptyFetchSequence,
    /// A type or direction keyword was not recognized.
    UnknownKeyword {
        /// What the keyword was supposed to name.
        kind: &'static str,
        /// The keyword.
        value: String
    },
    /// Data was copied between microinstructions of different kinds.
    MismatchedMicroKind {
        /// The kind of the destination.
        expected: &'static str,
        /// The kind of the source.
        found: &'static str
    },
}
impl std::fmt::Display for ValidationErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationErr::InvalidWidth { module, width } => write!(f, "{module} has invalid width {width}"),
            ValidationErr::EmptyModule(name) => write!(f, "{name} has no elements"),
            ValidationErr::DuplicateName { kind, name } => write!(f, "more than one {kind} is named {name}"),
            ValidationErr::DanglingHandle { owner } => write!(f, "{owner} refers to a module that does not exist"),
            ValidationErr::BitRangeOutOfBounds { micro, start, num_bits, width } => write!(f, "{micro}: bits {start}..{} do not fit in {width} bits", u64::from(*start) + u64::from(*num_bits)),
            ValidationErr::MismatchedWidths { micro } => write!(f, "{micro}: source and destination have different widths"),
            ValidationErr::DataWidthNotMultiple { micro, width, cell_size } => write!(f, "{micro}: data width {width} is not a multiple of the cell size {cell_size}"),
            ValidationErr::ValueDoesNotFit { owner, value, width } => write!(f, "{owner}: value {value} does not fit in {width} bits"),
            ValidationErr::NoOpcodeField(instr) => write!(f, "instruction {instr} has no fields"),
            ValidationErr::OpcodeDoesNotFit { instr, opcode, width } => write!(f, "instruction {instr}: opcode {opcode:#x} does not fit in {width} bits"),
            ValidationErr::InstructionTooWide { instr, width } => write!(f, "instruction {instr} is {width} bits wide"),
            ValidationErr::EmptyFetchSequence => f.write_str("fetch sequence is empty"),
            ValidationErr::UnknownKeyword { kind, value } => write!(f, "unknown {kind} {value:?}"),
            ValidationErr::MismatchedMicroKind { expected, found } => write!(f, "cannot copy {found} microinstruction into {expected} microinstruction"),
        }
    }
}
impl std::error::Error for ValidationErr {}
impl crate::err::Error for ValidationErr {
    fn help(&self) -> Option<Cow<str>> {
        match self {
            ValidationErr::InvalidWidth { .. } => Some(format!("widths must be between 1 and {MAX_WIDTH}").into()),
            ValidationErr::EmptyModule(_) => Some("register arrays and RAMs need at least one element".into()),
            ValidationErr::DuplicateName { .. } => Some("rename one of them".into()),
            ValidationErr::DanglingHandle { .. } => Some("handles must come from the builder the machine is built with".into()),
            ValidationErr::BitRangeOutOfBounds { .. } => Some("bit ranges need at least one bit and must end within the width".into()),
            ValidationErr::DataWidthNotMultiple { .. } => Some("memory accesses read and write whole cells".into()),
            ValidationErr::InstructionTooWide { .. } => Some(format!("instructions can be at most {MAX_WIDTH} bits").into()),
            ValidationErr::EmptyFetchSequence => Some("the fetch sequence usually reads memory into the instruction register, then decodes".into()),
            _ => None,
        }
    }
}

/// Builds a [`Machine`].
///
/// Modules, fields, microinstructions, and instructions are added one at a time;
/// each `add_*` method returns a handle that later additions can refer to.
///
/// ```
/// use cpusim_engine::machine::MachineBuilder;
/// use cpusim_engine::machine::hw::{Register, Ram};
/// use cpusim_engine::machine::micro::{Micro, MicroOp, AccessDirection};
///
/// let mut b = MachineBuilder::new();
/// let pc = b.add_register(Register::new("pc", 8));
/// let ir = b.add_register(Register::new("ir", 8));
/// let mem = b.add_ram(Ram::new("main", 256, 8));
///
/// let read = b.add_micro(Micro::new("ir<-mem[pc]", MicroOp::MemoryAccess {
///     direction: AccessDirection::Read, memory: mem, data: ir.into(), address: pc.into()
/// }));
/// let inc = b.add_micro(Micro::new("pc++", MicroOp::Increment {
///     register: pc.into(), delta: 1, overflow_bit: None, carry_bit: None
/// }));
/// b.set_fetch_sequence(vec![read, inc]);
///
/// let machine = b.build().unwrap();
/// assert_eq!(machine.fetch_sequence().micros().len(), 2);
/// ```
#[derive(Default)]
pub struct MachineBuilder {
    hw: Hardware,
    fields: Vec<Field>,
    micros: Vec<Micro>,
    instrs: Vec<MachineInstruction>,
    fetch: Vec<MicroId>,
    channels: Channels,
    flags: MachineFlags
}
impl MachineBuilder {
    /// Creates a new builder with default flags.
    pub fn new() -> Self {
        Default::default()
    }
    /// Creates a new builder with the given flags.
    pub fn with_flags(flags: MachineFlags) -> Self {
        Self { flags, ..Default::default() }
    }

    /// Adds a register.
    pub fn add_register(&mut self, register: Register) -> RegisterId {
        self.hw.registers.push(register);
        RegisterId(self.hw.registers.len() - 1)
    }
    /// Adds a register array.
    pub fn add_array(&mut self, array: RegisterArray) -> ArrayId {
        self.hw.arrays.push(array);
        ArrayId(self.hw.arrays.len() - 1)
    }
    /// Adds a RAM.
    pub fn add_ram(&mut self, ram: Ram) -> RamId {
        self.hw.rams.push(ram);
        RamId(self.hw.rams.len() - 1)
    }
    /// Adds a condition bit.
    pub fn add_condition_bit(&mut self, bit: ConditionBit) -> CondBitId {
        self.hw.cond_bits.push(bit);
        CondBitId(self.hw.cond_bits.len() - 1)
    }
    /// Adds an IO channel.
    pub fn add_channel(&mut self, name: impl Into<String>, channel: impl IoChannel + 'static) -> ChannelId {
        self.channels.add(name.into(), Box::new(channel))
    }
    /// Adds an instruction field.
    pub fn add_field(&mut self, field: Field) -> FieldId {
        self.fields.push(field);
        FieldId(self.fields.len() - 1)
    }
    /// Adds a microinstruction.
    pub fn add_micro(&mut self, micro: Micro) -> MicroId {
        self.micros.push(micro);
        MicroId(self.micros.len() - 1)
    }
    /// Adds a machine instruction.
    pub fn add_instruction(&mut self, instr: MachineInstruction) -> InstrId {
        self.instrs.push(instr);
        InstrId(self.instrs.len() - 1)
    }
    /// Sets the microinstructions of the fetch sequence.
    pub fn set_fetch_sequence(&mut self, micros: Vec<MicroId>) {
        self.fetch = micros;
    }

    /// Validates the description and creates the machine.
    pub fn build(self) -> Result<Machine, ValidationErr> {
        let Self { mut hw, fields, micros, instrs, fetch, channels, flags } = self;
        hw.indexing = flags.indexing;

        validate_hardware(&hw)?;
        for micro in &micros {
            micro.validate(&hw, &channels)?;
        }
        check_unique("microinstruction", micros.iter().map(Micro::name))?;
        validate_instructions(&fields, &micros, &instrs)?;

        if fetch.is_empty() {
            return Err(ValidationErr::EmptyFetchSequence);
        }
        check_micros("Fetch sequence", &fetch, &micros)?;

        hw.clear();
        tracing::debug!(
            registers = hw.registers.len(),
            arrays = hw.arrays.len(),
            rams = hw.rams.len(),
            micros = micros.len(),
            instructions = instrs.len(),
            "built machine"
        );
        Ok(Machine::from_parts(hw, fields, micros, instrs, MachineInstruction::fetch_sequence(fetch), channels, flags))
    }
}

fn check_width(module: &str, width: u32) -> Result<(), ValidationErr> {
    match (1..=MAX_WIDTH).contains(&width) {
        true  => Ok(()),
        false => Err(ValidationErr::InvalidWidth { module: module.to_string(), width })
    }
}
fn check_unique<'a>(kind: &'static str, names: impl IntoIterator<Item=&'a str>) -> Result<(), ValidationErr> {
    let mut seen = HashSet::new();
    match names.into_iter().find(|name| !seen.insert(*name)) {
        Some(name) => Err(ValidationErr::DuplicateName { kind, name: name.to_string() }),
        None => Ok(())
    }
}
fn check_micros(owner: &str, ids: &[MicroId], micros: &[Micro]) -> Result<(), ValidationErr> {
    match ids.iter().all(|m| m.0 < micros.len()) {
        true  => Ok(()),
        false => Err(ValidationErr::DanglingHandle { owner: owner.to_string() })
    }
}

fn validate_hardware(hw: &Hardware) -> Result<(), ValidationErr> {
    for reg in &hw.registers {
        check_width(reg.name(), reg.width())?;
    }
    for arr in &hw.arrays {
        check_width(arr.name(), arr.width())?;
        if arr.is_empty() { return Err(ValidationErr::EmptyModule(arr.name().to_string())) };
    }
    for ram in &hw.rams {
        check_width(ram.name(), ram.cell_size())?;
        if ram.is_empty() { return Err(ValidationErr::EmptyModule(ram.name().to_string())) };
    }
    for cb in &hw.cond_bits {
        let reg = hw.reg(cb.register())
            .ok_or_else(|| ValidationErr::DanglingHandle { owner: cb.name().to_string() })?;
        if cb.bit() >= reg.width() {
            return Err(ValidationErr::BitRangeOutOfBounds { micro: cb.name().to_string(), start: cb.bit(), num_bits: 1, width: reg.width() });
        }
    }

    check_unique("register", hw.registers.iter().map(Register::name))?;
    check_unique("register array", hw.arrays.iter().map(RegisterArray::name))?;
    check_unique("RAM", hw.rams.iter().map(Ram::name))?;
    check_unique("condition bit", hw.cond_bits.iter().map(ConditionBit::name))?;
    Ok(())
}

fn validate_instructions(fields: &[Field], micros: &[Micro], instrs: &[MachineInstruction]) -> Result<(), ValidationErr> {
    for field in fields {
        check_width(field.name(), field.width())?;
        if !field.accepts(field.default_value()) {
            return Err(ValidationErr::ValueDoesNotFit { owner: field.name().to_string(), value: field.default_value(), width: field.width() });
        }
    }
    check_unique("field", fields.iter().map(Field::name))?;

    for instr in instrs {
        let name = instr.name();
        let dangling = || ValidationErr::DanglingHandle { owner: name.to_string() };
        if instr.fields().iter().chain(instr.assembly_fields()).any(|f| f.0 >= fields.len()) {
            return Err(dangling());
        }
        check_micros(name, instr.micros(), micros)?;

        let Some(op_field) = instr.fields().first() else {
            return Err(ValidationErr::NoOpcodeField(name.to_string()));
        };
        let op_width = fields[op_field.0].width();
        // opcodes past i64::MAX wrap negative and are rejected
        if !crate::bits::fits(instr.opcode() as i64, op_width, false) {
            return Err(ValidationErr::OpcodeDoesNotFit { instr: name.to_string(), opcode: instr.opcode(), width: op_width });
        }
        let width = instr.width(fields);
        if width > MAX_WIDTH {
            return Err(ValidationErr::InstructionTooWide { instr: name.to_string(), width });
        }
    }
    check_unique("instruction", instrs.iter().map(MachineInstruction::name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::micro::MicroOp;

    fn fetch_only(b: &mut MachineBuilder) {
        let c = b.add_micro(Micro::new("nothing", MicroOp::Comment));
        b.set_fetch_sequence(vec![c]);
    }

    #[test]
    fn test_minimal() {
        let mut b = MachineBuilder::new();
        fetch_only(&mut b);
        assert!(b.build().is_ok());

        assert_eq!(MachineBuilder::new().build().err(), Some(ValidationErr::EmptyFetchSequence));
    }

    #[test]
    fn test_hardware_errors() {
        let mut b = MachineBuilder::new();
        fetch_only(&mut b);
        b.add_register(Register::new("wide", 65));
        assert_eq!(b.build().err(), Some(ValidationErr::InvalidWidth { module: "wide".to_string(), width: 65 }));

        let mut b = MachineBuilder::new();
        fetch_only(&mut b);
        b.add_register(Register::new("a", 8));
        b.add_register(Register::new("a", 4));
        assert_eq!(b.build().err(), Some(ValidationErr::DuplicateName { kind: "register", name: "a".to_string() }));

        let mut b = MachineBuilder::new();
        fetch_only(&mut b);
        b.add_ram(Ram::new("main", 0, 8));
        assert_eq!(b.build().err(), Some(ValidationErr::EmptyModule("main".to_string())));

        let mut b = MachineBuilder::new();
        fetch_only(&mut b);
        let flags = b.add_register(Register::new("flags", 4));
        b.add_condition_bit(ConditionBit::new("z", flags, 4));
        assert!(matches!(b.build(), Err(ValidationErr::BitRangeOutOfBounds { start: 4, width: 4, .. })));
    }

    #[test]
    fn test_instruction_errors() {
        let mut b = MachineBuilder::new();
        fetch_only(&mut b);
        let op = b.add_field(Field::new("op", 2));
        b.add_instruction(MachineInstruction::new("big", 4, vec![op]));
        assert_eq!(b.build().err(), Some(ValidationErr::OpcodeDoesNotFit { instr: "big".to_string(), opcode: 4, width: 2 }));

        let mut b = MachineBuilder::new();
        fetch_only(&mut b);
        b.add_instruction(MachineInstruction::new("none", 0, vec![]));
        assert_eq!(b.build().err(), Some(ValidationErr::NoOpcodeField("none".to_string())));

        let mut b = MachineBuilder::new();
        fetch_only(&mut b);
        let f = b.add_field(Field::new("f", 40));
        b.add_instruction(MachineInstruction::new("long", 0, vec![f, f]));
        assert_eq!(b.build().err(), Some(ValidationErr::InstructionTooWide { instr: "long".to_string(), width: 80 }));

        let mut b = MachineBuilder::new();
        fetch_only(&mut b);
        let op = b.add_field(Field::new("op", 2));
        b.add_instruction(MachineInstruction::new("lost", 0, vec![op]).with_micros(vec![MicroId(7)]));
        assert_eq!(b.build().err(), Some(ValidationErr::DanglingHandle { owner: "lost".to_string() }));

        let mut b = MachineBuilder::new();
        fetch_only(&mut b);
        b.add_field(Field::new("imm", 3).with_signed(true).with_default_value(4));
        assert_eq!(b.build().err(), Some(ValidationErr::ValueDoesNotFit { owner: "imm".to_string(), value: 4, width: 3 }));
    }

    #[test]
    fn test_micro_errors() {
        let mut b = MachineBuilder::new();
        fetch_only(&mut b);
        b.add_micro(Micro::new("nothing", MicroOp::End));
        assert_eq!(b.build().err(), Some(ValidationErr::DuplicateName { kind: "microinstruction", name: "nothing".to_string() }));

        let mut b = MachineBuilder::new();
        let a = b.add_register(Register::new("a", 8));
        let m = b.add_micro(Micro::new("t", MicroOp::Test {
            register: a.into(), start: 6, num_bits: 4, comparison: crate::machine::micro::Comparison::Eq, value: 0, omission: 1
        }));
        b.set_fetch_sequence(vec![m]);
        assert_eq!(
            b.build().err(),
            Some(ValidationErr::BitRangeOutOfBounds { micro: "t".to_string(), start: 6, num_bits: 4, width: 8 })
        );
    }
}
