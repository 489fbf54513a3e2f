//! Machine instructions and the fields they are built from.
//!
//! A [`MachineInstruction`] is a named opcode, a list of [`Field`]s describing how its
//! bits are laid out, and the micro-program (a list of microinstructions) that
//! implements it.
//!
//! The bits of an instruction are laid out left to right in field order.
//! The first field always holds the opcode.
//!
//! ```text
//!  opcode   reg   addr
//! [ 4 bits |2 b | 10 bits ]  (16-bit instruction)
//! ```
//!
//! Fields are consumed by the assembler (outside of this crate) and by decoding.
//! [`MachineInstruction::encode`] and [`MachineInstruction::decode_operands`]
//! are provided so that programs can be built and inspected without an assembler.

use std::borrow::Cow;

use crate::bits::{self, Indexing};
use super::micro::MicroId;

/// Handle to a [`Field`] owned by a machine.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct FieldId(pub(crate) usize);
/// Handle to a [`MachineInstruction`] owned by a machine.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct InstrId(pub(crate) usize);

/// How a field's value relates to the address of the instruction it appears in.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Relativity {
    /// The value is used as-is.
    #[default]
    Absolute,
    /// The value is relative to the address of the instruction itself.
    PcRelativePreIncr,
    /// The value is relative to the address of the instruction following this one.
    PcRelativePostIncr
}

/// Whether a field has to be provided in assembly.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum FieldType {
    /// The field must be given a value.
    #[default]
    Required,
    /// The field may be omitted, in which case its default value is used.
    Optional,
    /// The field never appears in assembly and always holds its default value.
    Ignored
}

/// A symbolic name for a field value (e.g., a register name standing for its number).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValue {
    /// The symbolic name.
    pub name: String,
    /// The value the name stands for.
    pub value: i64
}

/// A bit-field of an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    width: u32,
    relativity: Relativity,
    signed: bool,
    field_type: FieldType,
    default_value: i64,
    values: Vec<FieldValue>
}
impl Field {
    /// Creates an absolute, unsigned, required field with a default value of 0.
    pub fn new(name: impl Into<String>, width: u32) -> Self {
        Self {
            name: name.into(),
            width,
            relativity: Relativity::Absolute,
            signed: false,
            field_type: FieldType::Required,
            default_value: 0,
            values: vec![]
        }
    }
    /// Sets the relativity of this field.
    pub fn with_relativity(mut self, relativity: Relativity) -> Self {
        self.relativity = relativity;
        self
    }
    /// Sets whether this field's value is signed.
    pub fn with_signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }
    /// Sets whether this field is required, optional, or ignored.
    pub fn with_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }
    /// Sets the default value of this field.
    pub fn with_default_value(mut self, value: i64) -> Self {
        self.default_value = value;
        self
    }
    /// Adds a symbolic name for a value of this field.
    pub fn with_value(mut self, name: impl Into<String>, value: i64) -> Self {
        self.values.push(FieldValue { name: name.into(), value });
        self
    }

    /// The name of this field.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The number of bits in this field.
    pub fn width(&self) -> u32 {
        self.width
    }
    /// The relativity of this field.
    pub fn relativity(&self) -> Relativity {
        self.relativity
    }
    /// Whether this field holds a signed value.
    pub fn is_signed(&self) -> bool {
        self.signed
    }
    /// Whether this field is required, optional, or ignored.
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }
    /// The value used when the field is omitted.
    pub fn default_value(&self) -> i64 {
        self.default_value
    }
    /// The symbolic names of this field's values.
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }
    /// Looks up the value a symbolic name stands for.
    pub fn value_named(&self, name: &str) -> Option<i64> {
        self.values.iter()
            .find(|v| v.name == name)
            .map(|v| v.value)
    }

    /// Whether a value can be stored in this field.
    pub fn accepts(&self, value: i64) -> bool {
        bits::fits(value, self.width, self.signed)
    }

    /// Computes the value to encode for an operand, taking relativity into account.
    ///
    /// `address` is the address of the instruction, and `length` is the number
    /// of cells the instruction occupies.
    pub fn relative_value(&self, value: i64, address: i64, length: i64) -> i64 {
        match self.relativity {
            Relativity::Absolute           => value,
            Relativity::PcRelativePreIncr  => value.wrapping_sub(address),
            Relativity::PcRelativePostIncr => value.wrapping_sub(address.wrapping_add(length)),
        }
    }
}

/// Errors that can occur when encoding an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeErr {
    /// The number of operands given does not match the number of non-opcode fields.
    WrongOperandCount {
        /// The number of operands the instruction takes.
        expected: usize,
        /// The number of operands given.
        found: usize
    },
    /// An operand does not fit in its field.
    OperandDoesNotFit {
        /// The name of the field.
        field: String,
        /// The operand.
        value: i64
    }
}
impl std::fmt::Display for EncodeErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeErr::WrongOperandCount { expected, found } => write!(f, "expected {expected} operands, found {found}"),
            EncodeErr::OperandDoesNotFit { field, value } => write!(f, "value {value} does not fit in field {field}"),
        }
    }
}
impl std::error::Error for EncodeErr {}
impl crate::err::Error for EncodeErr {
    fn help(&self) -> Option<Cow<str>> {
        match self {
            EncodeErr::WrongOperandCount { .. } => Some("ignored fields still need an operand slot; their value is replaced by the default".into()),
            EncodeErr::OperandDoesNotFit { .. } => Some("check the field's width and signedness".into()),
        }
    }
}

/// A machine instruction.
///
/// Besides its fields, a machine instruction holds an ordered list of microinstructions
/// (its micro-program), which the control unit executes once the instruction is decoded.
///
/// The fetch sequence is also represented as a `MachineInstruction`, one with no fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInstruction {
    name: String,
    opcode: u64,
    fields: Vec<FieldId>,
    assembly_fields: Vec<FieldId>,
    micros: Vec<MicroId>
}
impl MachineInstruction {
    /// Creates an instruction from its name, opcode, and fields.
    ///
    /// The first field holds the opcode. The assembly fields default to the same fields.
    pub fn new(name: impl Into<String>, opcode: u64, fields: Vec<FieldId>) -> Self {
        Self {
            name: name.into(),
            opcode,
            assembly_fields: fields.clone(),
            fields,
            micros: vec![]
        }
    }
    /// Creates a field-less micro-program, used for the fetch sequence.
    pub(crate) fn fetch_sequence(micros: Vec<MicroId>) -> Self {
        Self {
            name: String::from("Fetch sequence"),
            opcode: 0,
            fields: vec![],
            assembly_fields: vec![],
            micros
        }
    }
    /// Sets the order fields appear in assembly.
    pub fn with_assembly_fields(mut self, fields: Vec<FieldId>) -> Self {
        self.assembly_fields = fields;
        self
    }
    /// Sets the micro-program of this instruction.
    pub fn with_micros(mut self, micros: Vec<MicroId>) -> Self {
        self.micros = micros;
        self
    }

    /// The name of this instruction.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The opcode of this instruction.
    pub fn opcode(&self) -> u64 {
        self.opcode
    }
    /// The fields of this instruction in bit order.
    pub fn fields(&self) -> &[FieldId] {
        &self.fields
    }
    /// The fields of this instruction in assembly order.
    pub fn assembly_fields(&self) -> &[FieldId] {
        &self.assembly_fields
    }
    /// The micro-program of this instruction.
    pub fn micros(&self) -> &[MicroId] {
        &self.micros
    }

    /// The total number of bits of this instruction.
    pub fn width(&self, fields: &[Field]) -> u32 {
        self.fields.iter()
            .map(|f| fields[f.0].width)
            .sum()
    }

    /// Whether the opcode of this instruction matches the leftmost bits of `ir`,
    /// a register value of `ir_width` bits.
    pub fn matches(&self, fields: &[Field], ir: i64, ir_width: u32) -> bool {
        let Some(op_field) = self.fields.first() else { return false };
        let op_width = fields[op_field.0].width;
        if op_width > ir_width { return false };

        let op = bits::extract_field(ir, ir_width, 0, op_width, Indexing::FromLeft);
        op as u64 == self.opcode
    }

    /// Packs this instruction's opcode and operands into a word.
    ///
    /// `operands` holds one value per field after the opcode field (in bit order).
    /// Ignored fields take their default value regardless of the operand given.
    ///
    /// The word is right-aligned (it occupies the low [`MachineInstruction::width`] bits).
    pub fn encode(&self, fields: &[Field], operands: &[i64]) -> Result<i64, EncodeErr> {
        let operand_fields = self.fields.get(1..).unwrap_or(&[]);
        if operand_fields.len() != operands.len() {
            return Err(EncodeErr::WrongOperandCount { expected: operand_fields.len(), found: operands.len() });
        }

        let mut word = self.opcode;
        for (fid, &value) in operand_fields.iter().zip(operands) {
            let field = &fields[fid.0];
            let value = match field.field_type {
                FieldType::Ignored => field.default_value,
                _ => value
            };
            if !field.accepts(value) {
                return Err(EncodeErr::OperandDoesNotFit { field: field.name.clone(), value });
            }
            word = word.checked_shl(field.width).unwrap_or(0) | bits::mask_to_width(value, field.width);
        }

        Ok(word as i64)
    }

    /// Unpacks the operands of a word produced by [`MachineInstruction::encode`].
    ///
    /// Signed fields are sign-extended.
    pub fn decode_operands(&self, fields: &[Field], word: i64) -> Vec<i64> {
        let width = self.width(fields);
        let mut start = 0;

        self.fields.iter()
            .map(|fid| {
                let field = &fields[fid.0];
                let raw = bits::extract_field(word, width, start, field.width, Indexing::FromLeft);
                start += field.width;
                match field.signed {
                    true  => bits::sign_extend(raw, field.width),
                    false => raw
                }
            })
            .skip(1)
            .collect()
    }
}
