//! The hardware modules of a machine.
//!
//! This module consists of:
//! - [`Register`]: A named, width-bearing value cell.
//! - [`RegisterArray`]: A fixed-length sequence of same-width registers.
//! - [`Ram`]: An addressable sequence of [`RamLocation`] cells.
//! - [`ConditionBit`]: A single bit of some register, used as a flag.
//! - [`Hardware`]: The arena that owns all of the above.
//!
//! Modules are referenced by handle ([`RegisterId`], [`ArrayId`], [`RamId`], [`CondBitId`])
//! rather than by reference. Handles are only handed out by [`MachineBuilder`],
//! so every handle held by a machine is valid for that machine's [`Hardware`].
//!
//! # Reading and writing
//!
//! Every module here can be read and written directly (e.g., [`Register::set_value`], [`Ram::set_data`]).
//! Direct access does not check read-only flags, does not trigger breakpoints,
//! and is not recorded for backup. It is meant for user interfaces and loaders.
//! Microinstructions go through the machine's execution context instead,
//! which performs those checks.
//!
//! ```
//! use cpusim_engine::machine::hw::{Register, Ram};
//!
//! let mut acc = Register::new("acc", 8);
//! acc.set_value(200);
//! assert_eq!(acc.value(), -56); // 200 does not fit in 8 signed bits
//! assert_eq!(acc.unsigned_value(), 200);
//!
//! let mut ram = Ram::new("Main", 16, 8);
//! ram.set_data(2, 0x1234, 16).unwrap();
//! assert_eq!(ram.get_data(2, 16), Some(0x1234));
//! assert_eq!(ram.get_data(3, 8), Some(0x34));
//! ```
//!
//! [`MachineBuilder`]: super::MachineBuilder

use crate::bits::{self, Indexing};

/// Handle to a [`Register`] owned by a [`Hardware`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct RegisterId(pub(crate) usize);
/// Handle to a [`RegisterArray`] owned by a [`Hardware`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct ArrayId(pub(crate) usize);
/// Handle to a [`Ram`] owned by a [`Hardware`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct RamId(pub(crate) usize);
/// Handle to a [`ConditionBit`] owned by a [`Hardware`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct CondBitId(pub(crate) usize);

/// A reference to a single register,
/// which is either a standalone register or an element of a register array.
///
/// Microinstructions accept either kind wherever they operate on a register.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum RegRef {
    /// A standalone register.
    Register(RegisterId),
    /// The register at the given index of a register array.
    Element(ArrayId, usize)
}
impl From<RegisterId> for RegRef {
    fn from(value: RegisterId) -> Self {
        RegRef::Register(value)
    }
}

/// A named register.
///
/// A register holds a value of `width` bits (1 to 64).
/// The value is always kept in canonical two's-complement form:
/// any write is truncated to `width` bits and sign-extended, so
/// `value() == bits::sign_extend(bits::mask_to_width(v, width), width)` after `set_value(v)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    name: String,
    width: u32,
    value: i64,
    initial_value: i64,
    read_only: bool
}
impl Register {
    /// Creates a register with the given name and width, initialized to 0.
    pub fn new(name: impl Into<String>, width: u32) -> Self {
        Self {
            name: name.into(),
            width,
            value: 0,
            initial_value: 0,
            read_only: false
        }
    }

    /// Sets the value this register starts with (and is restored to by [`Register::clear`]).
    pub fn with_initial_value(mut self, value: i64) -> Self {
        self.initial_value = bits::sign_extend(value, self.width);
        self.value = self.initial_value;
        self
    }

    /// Marks this register as read-only.
    ///
    /// Microinstructions that try to write a read-only register fail with an execution error.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// The name of this register.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The width of this register in bits.
    pub fn width(&self) -> u32 {
        self.width
    }
    /// Whether microinstructions are forbidden from writing to this register.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
    /// The value this register is reset to.
    pub fn initial_value(&self) -> i64 {
        self.initial_value
    }

    /// The current value of this register (sign-extended).
    pub fn value(&self) -> i64 {
        self.value
    }
    /// The current value of this register, read as an unsigned `width`-bit number.
    pub fn unsigned_value(&self) -> u64 {
        bits::mask_to_width(self.value, self.width)
    }
    /// Writes a value into this register, truncating it to the register's width.
    ///
    /// This does not check [`Register::is_read_only`].
    pub fn set_value(&mut self, value: i64) {
        self.value = bits::sign_extend(value, self.width);
    }
    /// Restores the register to its initial value.
    pub fn clear(&mut self) {
        self.value = self.initial_value;
    }
}

/// A named array of registers, all of the same width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterArray {
    name: String,
    width: u32,
    registers: Vec<Register>
}
impl RegisterArray {
    /// Creates a register array of `length` registers, each `width` bits wide.
    ///
    /// The registers are named `name[0]`, `name[1]`, etc.
    pub fn new(name: impl Into<String>, length: usize, width: u32) -> Self {
        let name = name.into();
        let registers = (0..length)
            .map(|i| Register::new(format!("{name}[{i}]"), width))
            .collect();

        Self { name, width, registers }
    }

    /// The name of this array.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The width of every register in this array.
    pub fn width(&self) -> u32 {
        self.width
    }
    /// The number of registers in this array.
    pub fn len(&self) -> usize {
        self.registers.len()
    }
    /// Whether this array has no registers.
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
    /// Gets the register at the given index, if it exists.
    pub fn get(&self, index: usize) -> Option<&Register> {
        self.registers.get(index)
    }
    /// Gets a mutable reference to the register at the given index, if it exists.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Register> {
        self.registers.get_mut(index)
    }
    /// Iterates over the registers of this array in index order.
    pub fn iter(&self) -> impl Iterator<Item=&Register> {
        self.registers.iter()
    }
    /// Restores every register of this array to its initial value.
    pub fn clear(&mut self) {
        self.registers.iter_mut().for_each(Register::clear);
    }
}

/// A single addressable cell of a [`Ram`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RamLocation {
    value: i64,
    /// Whether execution should break after this cell is accessed.
    pub breakpoint: bool,
    /// Annotation for the cell (usually the source line that assembled into it).
    pub comment: Option<String>,
    /// The line of the source program this cell was assembled from, if known.
    pub source_line: Option<usize>
}
impl RamLocation {
    /// The value held in this cell (sign-extended to the RAM's cell size).
    pub fn value(&self) -> i64 {
        self.value
    }
}

/// Random-access memory.
///
/// A RAM is `length` cells of `cell_size` bits each.
/// Data is accessed in units of `num_bits`, where `num_bits` is a multiple of the cell size.
/// An access of `num_bits` spans `num_bits / cell_size` consecutive cells,
/// where the cell at the lowest address holds the most significant bits.
///
/// Note that this struct provides two methods of accessing memory:
/// - [`Ram::location`] and [`Ram::location_mut`]: direct access to individual cells
/// - [`Ram::get_data`] and [`Ram::set_data`]: multi-cell access with range checks
///
/// Neither triggers breakpoints.
/// Breakpoints are checked by the `MemoryAccess` microinstruction
/// (with [`Ram::break_at_address`]) after its access completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ram {
    name: String,
    cell_size: u32,
    cells: Vec<RamLocation>
}
impl Ram {
    /// Creates a RAM with `length` cells of `cell_size` bits each, all initialized to 0.
    pub fn new(name: impl Into<String>, length: usize, cell_size: u32) -> Self {
        Self {
            name: name.into(),
            cell_size,
            cells: vec![RamLocation::default(); length]
        }
    }

    /// The name of this RAM.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The number of bits per cell.
    pub fn cell_size(&self) -> u32 {
        self.cell_size
    }
    /// The number of addressable cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }
    /// Whether this RAM has no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
    /// The number of cells an access of `num_bits` bits spans.
    pub fn cells_spanned(&self, num_bits: u32) -> usize {
        let cell_size = self.cell_size.max(1);
        ((num_bits + cell_size - 1) / cell_size) as usize
    }

    /// Gets the cell at the given address.
    pub fn location(&self, addr: usize) -> Option<&RamLocation> {
        self.cells.get(addr)
    }
    /// Gets a mutable reference to the cell at the given address.
    pub fn location_mut(&mut self, addr: usize) -> Option<&mut RamLocation> {
        self.cells.get_mut(addr)
    }
    /// Iterates over all cells in address order.
    pub fn iter(&self) -> impl Iterator<Item=&RamLocation> {
        self.cells.iter()
    }

    /// Checks that an access of `num_bits` bits at `addr` stays in bounds,
    /// returning the range of addresses it touches.
    pub fn span(&self, addr: usize, num_bits: u32) -> Option<std::ops::Range<usize>> {
        let end = addr.checked_add(self.cells_spanned(num_bits))?;
        (end <= self.cells.len()).then_some(addr..end)
    }

    /// Reads `num_bits` bits starting at address `addr`.
    ///
    /// This returns `None` if any cell of the access is out of bounds.
    pub fn get_data(&self, addr: usize, num_bits: u32) -> Option<i64> {
        let span = self.span(addr, num_bits)?;
        let data = self.cells[span].iter()
            .fold(0u64, |acc, cell| {
                acc.checked_shl(self.cell_size).unwrap_or(0) | bits::mask_to_width(cell.value, self.cell_size)
            });

        Some(bits::sign_extend(data as i64, num_bits))
    }

    /// Writes the low `num_bits` bits of `value` starting at address `addr`.
    ///
    /// This returns `None` (and writes nothing) if any cell of the access is out of bounds.
    pub fn set_data(&mut self, addr: usize, value: i64, num_bits: u32) -> Option<()> {
        let span = self.span(addr, num_bits)?;
        let cell_size = self.cell_size;

        let mut data = bits::mask_to_width(value, num_bits);
        for cell in self.cells[span].iter_mut().rev() {
            cell.value = bits::sign_extend(data as i64, cell_size);
            data = data.checked_shr(cell_size).unwrap_or(0);
        }
        Some(())
    }

    /// Whether any cell in the given address range has a breakpoint.
    pub fn break_at_address(&self, addrs: std::ops::Range<usize>) -> bool {
        self.cells.get(addrs)
            .is_some_and(|cells| cells.iter().any(|c| c.breakpoint))
    }

    /// Sets or clears the breakpoint of the cell at the given address.
    ///
    /// This returns whether the address exists.
    pub fn set_breakpoint(&mut self, addr: usize, breakpoint: bool) -> bool {
        match self.cells.get_mut(addr) {
            Some(cell) => {
                cell.breakpoint = breakpoint;
                true
            },
            None => false
        }
    }

    /// Zeroes all cells. Breakpoints and annotations are kept.
    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| c.value = 0);
    }
}

/// Converts the value of an address register into a RAM address.
///
/// A register narrower than 32 bits holding a negative value is reinterpreted
/// as unsigned (`value + 2^width`), so that, e.g., an 8-bit register holding `0xFF`
/// addresses cell 255.
/// Registers of 32 bits or wider are used as-is, so negative values stay negative
/// (and are out of range for every RAM).
pub fn resolve_address(value: i64, width: u32) -> i64 {
    match value < 0 && width < 32 {
        true  => value + (1i64 << width),
        false => value,
    }
}

/// A one-bit flag backed by a bit of a register.
///
/// If the bit is marked as a halt bit, the machine halts whenever the bit reads 1
/// after a microinstruction has executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionBit {
    name: String,
    register: RegRef,
    bit: u32,
    halt: bool
}
impl ConditionBit {
    /// Creates a condition bit over bit `bit` of `register`,
    /// where `bit` is numbered by the machine's [`Indexing`].
    pub fn new(name: impl Into<String>, register: impl Into<RegRef>, bit: u32) -> Self {
        Self {
            name: name.into(),
            register: register.into(),
            bit,
            halt: false
        }
    }
    /// Marks this condition bit as a halt bit.
    pub fn with_halt(mut self, halt: bool) -> Self {
        self.halt = halt;
        self
    }

    /// The name of this condition bit.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The register this bit lives in.
    pub fn register(&self) -> RegRef {
        self.register
    }
    /// The position of this bit within its register.
    pub fn bit(&self) -> u32 {
        self.bit
    }
    /// Whether setting this bit halts the machine.
    pub fn is_halt(&self) -> bool {
        self.halt
    }
}

/// The owner of every hardware module in a machine.
///
/// `Hardware` can be indexed by the module handles:
/// ```
/// use cpusim_engine::machine::MachineBuilder;
/// use cpusim_engine::machine::hw::Register;
///
/// let mut builder = MachineBuilder::new();
/// let pc = builder.add_register(Register::new("pc", 12));
/// let machine = builder.build().unwrap();
///
/// assert_eq!(machine.hw()[pc].name(), "pc");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Hardware {
    pub(crate) registers: Vec<Register>,
    pub(crate) arrays: Vec<RegisterArray>,
    pub(crate) rams: Vec<Ram>,
    pub(crate) cond_bits: Vec<ConditionBit>,
    pub(crate) indexing: Indexing
}
impl Hardware {
    /// The bit-numbering convention this hardware uses.
    pub fn indexing(&self) -> Indexing {
        self.indexing
    }

    /// Gets the register a [`RegRef`] refers to.
    ///
    /// Returns `None` only for an array element whose index is out of bounds.
    pub fn reg(&self, r: RegRef) -> Option<&Register> {
        match r {
            RegRef::Register(id) => self.registers.get(id.0),
            RegRef::Element(arr, i) => self.arrays.get(arr.0)?.get(i),
        }
    }
    /// Gets a mutable reference to the register a [`RegRef`] refers to.
    pub fn reg_mut(&mut self, r: RegRef) -> Option<&mut Register> {
        match r {
            RegRef::Register(id) => self.registers.get_mut(id.0),
            RegRef::Element(arr, i) => self.arrays.get_mut(arr.0)?.get_mut(i),
        }
    }

    /// Reads the value of a condition bit.
    pub fn condition_bit(&self, id: CondBitId) -> bool {
        let cb = &self[id];
        self.reg(cb.register)
            .is_some_and(|r| bits::extract_field(r.value(), r.width(), cb.bit, 1, self.indexing) != 0)
    }
    /// Writes the value of a condition bit directly (no read-only check).
    pub fn set_condition_bit(&mut self, id: CondBitId, value: bool) {
        let indexing = self.indexing;
        let ConditionBit { register, bit, .. } = self[id];
        if let Some(r) = self.reg_mut(register) {
            let new = bits::insert_field(r.value(), i64::from(value), r.width(), bit, 1, indexing);
            r.set_value(new);
        }
    }
    /// Whether any halt bit is currently set.
    pub fn halt_bit_set(&self) -> bool {
        (0..self.cond_bits.len())
            .map(CondBitId)
            .any(|id| self[id].halt && self.condition_bit(id))
    }

    /// Iterates over all standalone registers with their handles.
    pub fn registers(&self) -> impl Iterator<Item=(RegisterId, &Register)> {
        self.registers.iter().enumerate().map(|(i, r)| (RegisterId(i), r))
    }
    /// Iterates over all register arrays with their handles.
    pub fn arrays(&self) -> impl Iterator<Item=(ArrayId, &RegisterArray)> {
        self.arrays.iter().enumerate().map(|(i, a)| (ArrayId(i), a))
    }
    /// Iterates over all RAMs with their handles.
    pub fn rams(&self) -> impl Iterator<Item=(RamId, &Ram)> {
        self.rams.iter().enumerate().map(|(i, r)| (RamId(i), r))
    }
    /// Iterates over all condition bits with their handles.
    pub fn condition_bits(&self) -> impl Iterator<Item=(CondBitId, &ConditionBit)> {
        self.cond_bits.iter().enumerate().map(|(i, c)| (CondBitId(i), c))
    }

    /// Looks up a standalone register by name.
    pub fn register_by_name(&self, name: &str) -> Option<RegisterId> {
        self.registers.iter().position(|r| r.name == name).map(RegisterId)
    }
    /// Looks up a register array by name.
    pub fn array_by_name(&self, name: &str) -> Option<ArrayId> {
        self.arrays.iter().position(|a| a.name == name).map(ArrayId)
    }
    /// Looks up a RAM by name.
    pub fn ram_by_name(&self, name: &str) -> Option<RamId> {
        self.rams.iter().position(|r| r.name == name).map(RamId)
    }
    /// Looks up a condition bit by name.
    pub fn condition_bit_by_name(&self, name: &str) -> Option<CondBitId> {
        self.cond_bits.iter().position(|c| c.name == name).map(CondBitId)
    }

    /// Restores all registers to their initial values and zeroes all RAM cells.
    pub fn clear(&mut self) {
        self.registers.iter_mut().for_each(Register::clear);
        self.arrays.iter_mut().for_each(RegisterArray::clear);
        self.rams.iter_mut().for_each(Ram::clear);
    }
}

macro_rules! arena_index {
    ($($Id:ident => $field:ident: $T:ty),+) => {
        $(
            impl std::ops::Index<$Id> for Hardware {
                type Output = $T;

                fn index(&self, index: $Id) -> &Self::Output {
                    &self.$field[index.0]
                }
            }
            impl std::ops::IndexMut<$Id> for Hardware {
                fn index_mut(&mut self, index: $Id) -> &mut Self::Output {
                    &mut self.$field[index.0]
                }
            }
        )+
    }
}
arena_index! {
    RegisterId => registers: Register,
    ArrayId => arrays: RegisterArray,
    RamId => rams: Ram,
    CondBitId => cond_bits: ConditionBit
}
