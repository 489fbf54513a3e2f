//! Microinstructions, the primitive operations machine instructions are built from.
//!
//! A [`Micro`] is a name plus a [`MicroOp`], which says what it does and which
//! hardware modules it operates on. Every variant is executed by [`Micro::execute`]
//! against an execution context, which routes every register, condition bit, and RAM
//! write through the same checks (read-only registers, backup recording, change observation).
//!
//! The control unit advances its cursor *before* a microinstruction executes,
//! so microinstructions that move the cursor ([`MicroOp::Test`], [`MicroOp::Branch`],
//! [`MicroOp::Decode`], [`MicroOp::End`]) do so relative to the next microinstruction.
//!
//! The type and direction enums here parse from the keywords used in
//! machine descriptions:
//! ```
//! use cpusim_engine::machine::micro::{ArithmeticKind, Comparison};
//!
//! assert_eq!("add".parse::<ArithmeticKind>().unwrap(), ArithmeticKind::Add);
//! assert_eq!("GE".parse::<Comparison>().unwrap(), Comparison::Ge);
//! assert!("modulo".parse::<ArithmeticKind>().is_err());
//! ```

use crate::bits::{self, ShiftDirection, ShiftKind};
use super::backup::Change;
use super::control::{Current, Cursor};
use super::hw::{self, ArrayId, CondBitId, Hardware, RamId, RegRef, Register, RegisterId};
use super::instr::{Field, InstrId, MachineInstruction};
use super::io::{ChannelId, Channels, IoToken};
use super::observer::{AccessSet, ChangeObserver};
use super::{ExecErrKind, ValidationErr};

/// Handle to a [`Micro`] owned by a machine.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct MicroId(pub(crate) usize);

macro_rules! keywords {
    ($($Type:ident: $label:literal { $($Variant:ident = $kw:literal),+ $(,)? })+) => {
        $(
            impl std::str::FromStr for $Type {
                type Err = ValidationErr;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    $(
                        if s.eq_ignore_ascii_case($kw) { return Ok(Self::$Variant) }
                    )+
                    Err(ValidationErr::UnknownKeyword { kind: $label, value: s.to_string() })
                }
            }
            impl std::fmt::Display for $Type {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str(match self {
                        $(Self::$Variant => $kw),+
                    })
                }
            }
        )+
    }
}

/// The operation of an [`MicroOp::Arithmetic`] microinstruction.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ArithmeticKind {
    /// `dest = src1 + src2`
    Add,
    /// `dest = src1 - src2`
    Subtract,
    /// `dest = src1 * src2`
    Multiply,
    /// `dest = src1 / src2`, truncated toward zero
    Divide
}
/// The operation of a [`MicroOp::Logical`] microinstruction.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[allow(missing_docs)]
pub enum LogicalKind {
    And, Or, Nand, Nor, Xor,
    /// Bitwise complement of the first source. The second source is ignored.
    Not
}
/// The comparison a [`MicroOp::Test`] microinstruction performs.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[allow(missing_docs)]
pub enum Comparison {
    Eq, Ne, Lt, Gt, Le, Ge
}
impl Comparison {
    /// Whether `lhs <op> rhs` holds.
    pub fn holds(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Comparison::Eq => lhs == rhs,
            Comparison::Ne => lhs != rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Gt => lhs > rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Ge => lhs >= rhs,
        }
    }
}
/// The direction of a [`MicroOp::MemoryAccess`] microinstruction.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum AccessDirection {
    /// Memory to data register.
    Read,
    /// Data register to memory.
    Write
}
/// How an [`MicroOp::Io`] microinstruction interprets its value.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum IoKind {
    /// A (signed) integer.
    Integer,
    /// An ASCII character code.
    Ascii,
    /// A Unicode code point.
    Unicode
}
/// The direction of an [`MicroOp::Io`] microinstruction.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum IoDirection {
    /// Channel to buffer register.
    Input,
    /// Buffer register to channel.
    Output
}

keywords! {
    ArithmeticKind: "arithmetic type" { Add = "ADD", Subtract = "SUBTRACT", Multiply = "MULTIPLY", Divide = "DIVIDE" }
    LogicalKind: "logical type" { And = "AND", Or = "OR", Nand = "NAND", Nor = "NOR", Xor = "XOR", Not = "NOT" }
    Comparison: "comparison" { Eq = "EQ", Ne = "NE", Lt = "LT", Gt = "GT", Le = "LE", Ge = "GE" }
    AccessDirection: "memory access direction" { Read = "read", Write = "write" }
    IoKind: "IO type" { Integer = "integer", Ascii = "ascii", Unicode = "unicode" }
    IoDirection: "IO direction" { Input = "input", Output = "output" }
    ShiftKind: "shift type" { Logical = "logical", Arithmetic = "arithmetic", Cyclic = "cyclic" }
    ShiftDirection: "shift direction" { Left = "left", Right = "right" }
}

/// A hardware module a microinstruction can refer to.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ModuleRef {
    /// A register or register array element.
    Register(RegRef),
    /// A register array (or any of its elements).
    Array(ArrayId),
    /// A RAM.
    Ram(RamId),
    /// A condition bit.
    ConditionBit(CondBitId),
    /// An IO channel.
    Channel(ChannelId)
}
impl ModuleRef {
    /// Whether a reference held by a microinstruction (`self`) counts as a use of `query`.
    fn covers(self, query: ModuleRef) -> bool {
        match (self, query) {
            (ModuleRef::Register(RegRef::Element(a, _)), ModuleRef::Array(b)) => a == b,
            (held, query) => held == query
        }
    }
}
impl From<RegRef> for ModuleRef {
    fn from(value: RegRef) -> Self {
        ModuleRef::Register(value)
    }
}
impl From<RegisterId> for ModuleRef {
    fn from(value: RegisterId) -> Self {
        ModuleRef::Register(RegRef::Register(value))
    }
}

/// What a microinstruction does, and the modules it operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MicroOp {
    /// Combines two registers into a third.
    ///
    /// Overflow is detected against the destination width.
    /// Carry is only computed for addition and subtraction.
    #[allow(missing_docs)]
    Arithmetic {
        kind: ArithmeticKind,
        source1: RegRef,
        source2: RegRef,
        destination: RegRef,
        overflow_bit: Option<CondBitId>,
        carry_bit: Option<CondBitId>
    },
    /// Shifts a register within its own width. Source and destination have the same width.
    #[allow(missing_docs)]
    Shift {
        source: RegRef,
        destination: RegRef,
        kind: ShiftKind,
        direction: ShiftDirection,
        distance: u32
    },
    /// Bitwise logic on two registers.
    #[allow(missing_docs)]
    Logical {
        kind: LogicalKind,
        source1: RegRef,
        source2: RegRef,
        destination: RegRef
    },
    /// Adds a constant to a register.
    #[allow(missing_docs)]
    Increment {
        register: RegRef,
        delta: i64,
        overflow_bit: Option<CondBitId>,
        carry_bit: Option<CondBitId>
    },
    /// Moves data between a register and RAM.
    ///
    /// The data register's width determines how many consecutive cells are accessed.
    #[allow(missing_docs)]
    MemoryAccess {
        direction: AccessDirection,
        memory: RamId,
        data: RegRef,
        address: RegRef
    },
    /// Copies a bit range of one register into a bit range of another.
    #[allow(missing_docs)]
    TransferRtoR {
        source: RegRef,
        src_start: u32,
        destination: RegRef,
        dest_start: u32,
        num_bits: u32
    },
    /// Copies a bit range of a register into an array element
    /// chosen by a bit range of an index register.
    #[allow(missing_docs)]
    TransferRtoA {
        source: RegRef,
        src_start: u32,
        destination: ArrayId,
        dest_start: u32,
        num_bits: u32,
        index: RegRef,
        index_start: u32,
        index_num_bits: u32
    },
    /// Copies a bit range of an array element (chosen by a bit range of an index register)
    /// into a register.
    #[allow(missing_docs)]
    TransferAtoR {
        source: ArrayId,
        src_start: u32,
        destination: RegRef,
        dest_start: u32,
        num_bits: u32,
        index: RegRef,
        index_start: u32,
        index_num_bits: u32
    },
    /// Compares a bit range of a register against a constant,
    /// skipping `omission` microinstructions if the comparison holds.
    ///
    /// A range covering the whole register compares its signed value.
    /// A narrower range compares the unsigned value of the field.
    #[allow(missing_docs)]
    Test {
        register: RegRef,
        start: u32,
        num_bits: u32,
        comparison: Comparison,
        value: i64,
        omission: i64
    },
    /// Moves the cursor by `amount` microinstructions (1 is the next microinstruction).
    #[allow(missing_docs)]
    Branch {
        amount: i64
    },
    /// Finds the instruction whose opcode matches the left-most bits of the
    /// instruction register and jumps to the start of its micro-program.
    #[allow(missing_docs)]
    Decode {
        ir: RegRef
    },
    /// Sets or clears a condition bit.
    #[allow(missing_docs)]
    SetCondBit {
        bit: CondBitId,
        value: bool
    },
    /// Writes a constant into a bit range of a register.
    #[allow(missing_docs)]
    SetBits {
        register: RegRef,
        start: u32,
        num_bits: u32,
        value: i64
    },
    /// Moves a value between a register and an IO channel.
    #[allow(missing_docs)]
    Io {
        kind: IoKind,
        direction: IoDirection,
        buffer: RegRef,
        channel: ChannelId
    },
    /// Does nothing.
    Comment,
    /// Ends the current machine instruction.
    End
}
impl MicroOp {
    /// A short name for this kind of microinstruction.
    pub fn kind_name(&self) -> &'static str {
        match self {
            MicroOp::Arithmetic { .. }   => "arithmetic",
            MicroOp::Shift { .. }        => "shift",
            MicroOp::Logical { .. }      => "logical",
            MicroOp::Increment { .. }    => "increment",
            MicroOp::MemoryAccess { .. } => "memoryAccess",
            MicroOp::TransferRtoR { .. } => "transferRtoR",
            MicroOp::TransferRtoA { .. } => "transferRtoA",
            MicroOp::TransferAtoR { .. } => "transferAtoR",
            MicroOp::Test { .. }         => "test",
            MicroOp::Branch { .. }       => "branch",
            MicroOp::Decode { .. }       => "decode",
            MicroOp::SetCondBit { .. }   => "setCondBit",
            MicroOp::SetBits { .. }      => "set",
            MicroOp::Io { .. }           => "io",
            MicroOp::Comment             => "comment",
            MicroOp::End                 => "end",
        }
    }

    /// Every module this operation refers to.
    pub fn references(&self) -> Vec<ModuleRef> {
        use ModuleRef as M;

        fn cond_bits(bits: [Option<CondBitId>; 2]) -> impl Iterator<Item=ModuleRef> {
            bits.into_iter().flatten().map(ModuleRef::ConditionBit)
        }
        match *self {
            MicroOp::Arithmetic { source1, source2, destination, overflow_bit, carry_bit, .. } => {
                [source1, source2, destination].map(M::Register).into_iter()
                    .chain(cond_bits([overflow_bit, carry_bit]))
                    .collect()
            },
            MicroOp::Shift { source, destination, .. } => vec![source.into(), destination.into()],
            MicroOp::Logical { source1, source2, destination, .. } => vec![source1.into(), source2.into(), destination.into()],
            MicroOp::Increment { register, overflow_bit, carry_bit, .. } => {
                std::iter::once(M::Register(register))
                    .chain(cond_bits([overflow_bit, carry_bit]))
                    .collect()
            },
            MicroOp::MemoryAccess { memory, data, address, .. } => vec![M::Ram(memory), data.into(), address.into()],
            MicroOp::TransferRtoR { source, destination, .. } => vec![source.into(), destination.into()],
            MicroOp::TransferRtoA { source, destination, index, .. } => vec![source.into(), M::Array(destination), index.into()],
            MicroOp::TransferAtoR { source, destination, index, .. } => vec![M::Array(source), destination.into(), index.into()],
            MicroOp::Test { register, .. } => vec![register.into()],
            MicroOp::Decode { ir } => vec![ir.into()],
            MicroOp::SetCondBit { bit, .. } => vec![M::ConditionBit(bit)],
            MicroOp::SetBits { register, .. } => vec![register.into()],
            MicroOp::Io { buffer, channel, .. } => vec![buffer.into(), M::Channel(channel)],
            MicroOp::Branch { .. } | MicroOp::Comment | MicroOp::End => vec![],
        }
    }
}

/// A named microinstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Micro {
    name: String,
    op: MicroOp
}
impl Micro {
    /// Creates a new microinstruction.
    pub fn new(name: impl Into<String>, op: MicroOp) -> Self {
        Self { name: name.into(), op }
    }
    /// The name of this microinstruction.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The operation of this microinstruction.
    pub fn op(&self) -> &MicroOp {
        &self.op
    }

    /// Whether this microinstruction refers to the given module.
    ///
    /// Querying a register array also matches microinstructions that refer
    /// to an element of the array.
    pub fn uses(&self, module: impl Into<ModuleRef>) -> bool {
        let module = module.into();
        self.op.references()
            .into_iter()
            .any(|m| m.covers(module))
    }

    /// Overwrites `other` with this microinstruction's name and operands.
    ///
    /// Both microinstructions must be of the same kind.
    pub fn copy_data_to(&self, other: &mut Micro) -> Result<(), ValidationErr> {
        if std::mem::discriminant(&self.op) != std::mem::discriminant(&other.op) {
            return Err(ValidationErr::MismatchedMicroKind {
                expected: other.op.kind_name(),
                found: self.op.kind_name()
            });
        }
        other.clone_from(self);
        Ok(())
    }

    /// Checks this microinstruction against the hardware it will run on.
    pub(crate) fn validate(&self, hw: &Hardware, channels: &Channels) -> Result<(), ValidationErr> {
        let name = &self.name;
        let dangling = || ValidationErr::DanglingHandle { owner: name.clone() };

        // Every handle must resolve.
        for m in self.op.references() {
            let exists = match m {
                ModuleRef::Register(r)     => hw.reg(r).is_some(),
                ModuleRef::Array(a)        => a.0 < hw.arrays.len(),
                ModuleRef::Ram(r)          => r.0 < hw.rams.len(),
                ModuleRef::ConditionBit(c) => c.0 < hw.cond_bits.len(),
                ModuleRef::Channel(c)      => channels.contains(c),
            };
            if !exists { return Err(dangling()) };
        }

        let width = |r: RegRef| hw.reg(r).map_or(0, Register::width);
        let range = |start: u32, num_bits: u32, width: u32| match num_bits != 0 && start.checked_add(num_bits).is_some_and(|end| end <= width) {
            true  => Ok(()),
            false => Err(ValidationErr::BitRangeOutOfBounds { micro: name.clone(), start, num_bits, width })
        };

        match self.op {
            MicroOp::Shift { source, destination, .. } => {
                if width(source) != width(destination) {
                    return Err(ValidationErr::MismatchedWidths { micro: name.clone() });
                }
            },
            MicroOp::MemoryAccess { memory, data, .. } => {
                let cell_size = hw[memory].cell_size();
                let data_width = width(data);
                if data_width % cell_size != 0 {
                    return Err(ValidationErr::DataWidthNotMultiple { micro: name.clone(), width: data_width, cell_size });
                }
            },
            MicroOp::TransferRtoR { source, src_start, destination, dest_start, num_bits } => {
                range(src_start, num_bits, width(source))?;
                range(dest_start, num_bits, width(destination))?;
            },
            MicroOp::TransferRtoA { source, src_start, destination, dest_start, num_bits, index, index_start, index_num_bits } => {
                range(src_start, num_bits, width(source))?;
                range(dest_start, num_bits, hw[destination].width())?;
                range(index_start, index_num_bits, width(index))?;
            },
            MicroOp::TransferAtoR { source, src_start, destination, dest_start, num_bits, index, index_start, index_num_bits } => {
                range(src_start, num_bits, hw[source].width())?;
                range(dest_start, num_bits, width(destination))?;
                range(index_start, index_num_bits, width(index))?;
            },
            MicroOp::Test { register, start, num_bits, .. } => {
                range(start, num_bits, width(register))?;
            },
            MicroOp::SetBits { register, start, num_bits, value } => {
                range(start, num_bits, width(register))?;
                if !bits::fits(value, num_bits, true) && !bits::fits(value, num_bits, false) {
                    return Err(ValidationErr::ValueDoesNotFit { owner: name.clone(), value, width: num_bits });
                }
            },
            _ => {}
        }

        Ok(())
    }

    /// Executes this microinstruction.
    ///
    /// The context's cursor already points past this microinstruction.
    pub(crate) fn execute(&self, cx: &mut ExecCtx<'_>) -> Result<(), ExecErrKind> {
        let indexing = cx.hw.indexing();

        match self.op {
            MicroOp::Arithmetic { kind, source1, source2, destination, overflow_bit, carry_bit } => {
                let a = cx.read(source1)?;
                let b = cx.read(source2)?;
                let width = cx.register(destination)?.width();

                let (wide, carry) = match kind {
                    ArithmeticKind::Add => (i128::from(a) + i128::from(b), Some(bits::carries(a, b))),
                    ArithmeticKind::Subtract => {
                        let neg_b = bits::sign_extend(b.wrapping_neg(), width);
                        (i128::from(a) - i128::from(b), Some(bits::carries(a, neg_b)))
                    },
                    ArithmeticKind::Multiply => (i128::from(a) * i128::from(b), None),
                    ArithmeticKind::Divide => {
                        if b == 0 { return Err(ExecErrKind::DivideByZero) };
                        (i128::from(a) / i128::from(b), None)
                    },
                };

                // Truncation to the destination width happens on write.
                cx.write(destination, wide as i64)?;
                if let Some(bit) = overflow_bit {
                    cx.set_cond_bit(bit, bits::overflows(wide, width))?;
                }
                if let (Some(bit), Some(carry)) = (carry_bit, carry) {
                    cx.set_cond_bit(bit, carry)?;
                }
            },
            MicroOp::Shift { source, destination, kind, direction, distance } => {
                let value = cx.read(source)?;
                let width = cx.register(source)?.width();
                cx.write(destination, bits::shift(value, width, kind, direction, distance))?;
            },
            MicroOp::Logical { kind, source1, source2, destination } => {
                let a = cx.read(source1)?;
                let b = match kind {
                    LogicalKind::Not => 0,
                    _ => cx.read(source2)?
                };
                let result = match kind {
                    LogicalKind::And  => a & b,
                    LogicalKind::Or   => a | b,
                    LogicalKind::Nand => !(a & b),
                    LogicalKind::Nor  => !(a | b),
                    LogicalKind::Xor  => a ^ b,
                    LogicalKind::Not  => !a,
                };
                cx.write(destination, result)?;
            },
            MicroOp::Increment { register, delta, overflow_bit, carry_bit } => {
                let value = cx.read(register)?;
                let width = cx.register(register)?.width();
                let wide = i128::from(value) + i128::from(delta);

                cx.write(register, wide as i64)?;
                if let Some(bit) = overflow_bit {
                    cx.set_cond_bit(bit, bits::overflows(wide, width))?;
                }
                if let Some(bit) = carry_bit {
                    cx.set_cond_bit(bit, bits::carries(value, bits::sign_extend(delta, width)))?;
                }
            },
            MicroOp::MemoryAccess { direction, memory, data, address } => {
                let raw_addr = cx.read(address)?;
                let addr = hw::resolve_address(raw_addr, cx.register(address)?.width());
                let num_bits = cx.register(data)?.width();

                let ram = &cx.hw[memory];
                let span = usize::try_from(addr).ok()
                    .and_then(|a| ram.span(a, num_bits))
                    .ok_or_else(|| ExecErrKind::AddressOutOfRange { ram: ram.name().to_string(), address: addr })?;

                match direction {
                    AccessDirection::Read => {
                        let value = cx.read_ram(memory, span.clone(), num_bits)?;
                        cx.write(data, value)?;
                    },
                    AccessDirection::Write => {
                        let value = cx.read(data)?;
                        cx.write_ram(memory, span.clone(), value, num_bits)?;
                    }
                }

                if cx.hw[memory].break_at_address(span) {
                    cx.break_hit = true;
                }
            },
            MicroOp::TransferRtoR { source, src_start, destination, dest_start, num_bits } => {
                cx.transfer(source, src_start, destination, dest_start, num_bits)?;
            },
            MicroOp::TransferRtoA { source, src_start, destination, dest_start, num_bits, index, index_start, index_num_bits } => {
                let i = cx.array_index(destination, index, index_start, index_num_bits)?;
                cx.transfer(source, src_start, RegRef::Element(destination, i), dest_start, num_bits)?;
            },
            MicroOp::TransferAtoR { source, src_start, destination, dest_start, num_bits, index, index_start, index_num_bits } => {
                let i = cx.array_index(source, index, index_start, index_num_bits)?;
                cx.transfer(RegRef::Element(source, i), src_start, destination, dest_start, num_bits)?;
            },
            MicroOp::Test { register, start, num_bits, comparison, value, omission } => {
                let reg_value = cx.read(register)?;
                let width = cx.register(register)?.width();
                let field = match start == 0 && num_bits == width {
                    true  => reg_value,
                    false => bits::extract_field(reg_value, width, start, num_bits, indexing)
                };

                if comparison.holds(field, value) {
                    cx.jump(omission)?;
                }
            },
            MicroOp::Branch { amount } => {
                cx.jump(amount.saturating_sub(1))?;
            },
            MicroOp::Decode { ir } => {
                let value = cx.read(ir)?;
                let width = cx.register(ir)?.width();
                let found = cx.instrs.iter()
                    .position(|instr| instr.matches(cx.fields, value, width))
                    .ok_or(ExecErrKind::NoMatchingOpcode(bits::mask_to_width(value, width)))?;

                cx.cursor = Cursor { current: Current::Instr(InstrId(found)), micro_index: 0 };
            },
            MicroOp::SetCondBit { bit, value } => {
                cx.set_cond_bit(bit, value)?;
            },
            MicroOp::SetBits { register, start, num_bits, value } => {
                let reg = cx.register(register)?;
                let new = bits::insert_field(reg.value(), value, reg.width(), start, num_bits, indexing);
                cx.write(register, new)?;
            },
            MicroOp::Io { kind, direction: IoDirection::Input, buffer, channel } => {
                let width = cx.register(buffer)?.width();
                let token = match kind {
                    IoKind::Integer => IoToken::Integer(cx.channels.read_integer(channel)?),
                    IoKind::Ascii | IoKind::Unicode => IoToken::Char(cx.channels.read_char(channel)?),
                };
                cx.record(Change::Input { channel, token });
                if cx.echo {
                    match token {
                        IoToken::Integer(n) => cx.channels.write_integer(channel, n),
                        IoToken::Char(c) => cx.channels.write_char(channel, c),
                    }
                }

                let value = match token {
                    IoToken::Integer(n) => n,
                    IoToken::Char(c) if kind == IoKind::Ascii && !c.is_ascii() => return Err(ExecErrKind::InvalidChar(i64::from(u32::from(c)))),
                    IoToken::Char(c) => i64::from(u32::from(c)),
                };
                if !bits::fits(value, width, true) && !bits::fits(value, width, false) {
                    return Err(ExecErrKind::InputDoesNotFit { value, width });
                }
                cx.write(buffer, value)?;
            },
            MicroOp::Io { kind, direction: IoDirection::Output, buffer, channel } => {
                let value = cx.read(buffer)?;
                let unsigned = cx.register(buffer)?.unsigned_value();

                match kind {
                    IoKind::Integer => cx.channels.write_integer(channel, value),
                    IoKind::Ascii | IoKind::Unicode => {
                        let c = u32::try_from(unsigned).ok()
                            .and_then(char::from_u32)
                            .filter(|c| kind == IoKind::Unicode || c.is_ascii())
                            .ok_or(ExecErrKind::InvalidChar(value))?;
                        cx.channels.write_char(channel, c);
                    }
                }
            },
            MicroOp::Comment => {},
            MicroOp::End => {
                cx.cursor = Cursor::CYCLE_START;
            },
        }

        Ok(())
    }
}

/// Everything a microinstruction can touch while it executes.
pub(crate) struct ExecCtx<'m> {
    pub(crate) hw: &'m mut Hardware,
    pub(crate) fields: &'m [Field],
    pub(crate) instrs: &'m [MachineInstruction],
    pub(crate) channels: &'m mut Channels,
    pub(crate) observer: &'m mut ChangeObserver,
    /// Where old values are recorded, if history is being recorded.
    pub(crate) changes: Option<&'m mut Vec<Change>>,
    pub(crate) cursor: Cursor,
    pub(crate) echo: bool,
    pub(crate) break_hit: bool
}
impl ExecCtx<'_> {
    fn record(&mut self, change: Change) {
        if let Some(changes) = self.changes.as_deref_mut() {
            changes.push(change);
        }
    }

    fn register(&self, r: RegRef) -> Result<&Register, ExecErrKind> {
        self.hw.reg(r).ok_or_else(|| match r {
            RegRef::Element(arr, index) => ExecErrKind::IndexOutOfRange { index: index as u64, len: self.hw[arr].len() },
            // standalone register handles are checked by validation
            RegRef::Register(_) => ExecErrKind::IndexOutOfRange { index: 0, len: 0 },
        })
    }

    fn read(&mut self, r: RegRef) -> Result<i64, ExecErrKind> {
        let value = self.register(r)?.value();
        self.observer.update_reg_accesses(r, AccessSet::READ);
        Ok(value)
    }

    fn write(&mut self, r: RegRef, value: i64) -> Result<(), ExecErrKind> {
        let reg = self.register(r)?;
        if reg.is_read_only() {
            return Err(ExecErrKind::ReadOnly(reg.name().to_string()));
        }

        let old = reg.value();
        if let Some(reg) = self.hw.reg_mut(r) {
            reg.set_value(value);
            let new = reg.value();
            self.record(Change::Register { reg: r, old });
            self.observer.update_reg_accesses(r, AccessSet::write(old, new));
        }
        Ok(())
    }

    fn set_cond_bit(&mut self, id: CondBitId, value: bool) -> Result<(), ExecErrKind> {
        let (reg_ref, bit) = (self.hw[id].register(), self.hw[id].bit());
        let reg = self.register(reg_ref)?;
        let new = bits::insert_field(reg.value(), i64::from(value), reg.width(), bit, 1, self.hw.indexing());
        self.write(reg_ref, new)
    }

    fn read_ram(&mut self, ram: RamId, span: std::ops::Range<usize>, num_bits: u32) -> Result<i64, ExecErrKind> {
        let value = self.hw[ram].get_data(span.start, num_bits)
            .ok_or_else(|| ExecErrKind::AddressOutOfRange { ram: self.hw[ram].name().to_string(), address: span.start as i64 })?;
        for addr in span {
            self.observer.update_mem_accesses(ram, addr, AccessSet::READ);
        }
        Ok(value)
    }

    fn write_ram(&mut self, ram: RamId, span: std::ops::Range<usize>, value: i64, num_bits: u32) -> Result<(), ExecErrKind> {
        let olds: Vec<_> = self.hw[ram].iter()
            .skip(span.start)
            .take(span.len())
            .map(|loc| loc.value())
            .collect();
        self.hw[ram].set_data(span.start, value, num_bits)
            .ok_or_else(|| ExecErrKind::AddressOutOfRange { ram: self.hw[ram].name().to_string(), address: span.start as i64 })?;

        for (addr, old) in span.zip(olds) {
            let new = self.hw[ram].location(addr).map_or(old, |loc| loc.value());
            self.record(Change::Ram { ram, addr, old });
            self.observer.update_mem_accesses(ram, addr, AccessSet::write(old, new));
        }
        Ok(())
    }

    /// Copies `num_bits` bits from `src` (starting at `src_start`) into `dest` (starting at `dest_start`).
    fn transfer(&mut self, src: RegRef, src_start: u32, dest: RegRef, dest_start: u32, num_bits: u32) -> Result<(), ExecErrKind> {
        let indexing = self.hw.indexing();
        let src_value = self.read(src)?;
        let src_width = self.register(src)?.width();
        let field = bits::extract_field(src_value, src_width, src_start, num_bits, indexing);

        let dest_reg = self.register(dest)?;
        let new = bits::insert_field(dest_reg.value(), field, dest_reg.width(), dest_start, num_bits, indexing);
        self.write(dest, new)
    }

    /// Reads an array index out of a bit range of `index` and checks it against the array's length.
    fn array_index(&mut self, arr: ArrayId, index: RegRef, start: u32, num_bits: u32) -> Result<usize, ExecErrKind> {
        let value = self.read(index)?;
        let width = self.register(index)?.width();
        let i = bits::extract_field(value, width, start, num_bits, self.hw.indexing()) as u64;

        let len = self.hw[arr].len();
        usize::try_from(i).ok()
            .filter(|&i| i < len)
            .ok_or(ExecErrKind::IndexOutOfRange { index: i, len })
    }

    /// Moves the cursor `offset` microinstructions past its current position.
    fn jump(&mut self, offset: i64) -> Result<(), ExecErrKind> {
        let target = i64::try_from(self.cursor.micro_index).unwrap_or(i64::MAX).saturating_add(offset);
        self.cursor.micro_index = usize::try_from(target)
            .map_err(|_| ExecErrKind::MicroIndexOutOfRange(target as isize))?;
        Ok(())
    }
}
