//! Width-parameterized two's-complement arithmetic.
//!
//! Every value in the machine is held in an `i64`, no matter how wide the
//! register, array, or RAM cell holding it is. The functions in this module
//! treat that `i64` as a container for a narrower logical value of `width` bits
//! (`1..=64`), and are used by every microinstruction that has to manipulate
//! bits directly.
//!
//! The canonical form of a `width`-bit value is its sign-extended form, so
//! `sign_extend(v, w) == v` holds for every value that comes out of a register.
//!
//! This module consists of:
//! - [`sign_extend`], [`mask_to_width`]: conversions between the signed and unsigned views of a value
//! - [`extract_field`], [`insert_field`]: reading and writing bit ranges, honoring [`Indexing`]
//! - [`shift`]: the logical/arithmetic/cyclic shifts used by the `Shift` microinstruction
//! - [`overflows`], [`carries`]: overflow and carry detection for add/subtract
//!
//! ```
//! use cpusim_engine::bits::{self, Indexing};
//!
//! // 0xF0 as an 8-bit value is -16:
//! assert_eq!(bits::sign_extend(0xF0, 8), -16);
//! assert_eq!(bits::mask_to_width(-16, 8), 0xF0);
//!
//! // Bits 4..8 of 0xA5 (counted from the right):
//! assert_eq!(bits::extract_field(0xA5, 8, 4, 4, Indexing::FromRight), 0xA);
//! // Bits 4..8 of 0xA5 (counted from the left):
//! assert_eq!(bits::extract_field(0xA5, 8, 4, 4, Indexing::FromLeft), 0x5);
//! ```

/// The widest value a register, array, or RAM access can hold.
pub const MAX_WIDTH: u32 = 64;

/// The machine-wide convention for numbering bits within a register.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Indexing {
    /// Bit 0 is the least significant (rightmost) bit.
    #[default]
    FromRight,
    /// Bit 0 is the most significant (leftmost) bit of the value's width.
    FromLeft
}

/// The fill rule of a shift.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ShiftKind {
    /// Vacated bits are filled with 0.
    Logical,
    /// Right shifts fill vacated bits with the sign bit, left shifts fill with 0.
    Arithmetic,
    /// Bits shifted out of one end re-enter at the other end.
    Cyclic
}

/// The direction of a shift.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ShiftDirection {
    /// Towards the most significant bit.
    Left,
    /// Towards the least significant bit.
    Right
}

/// A mask of the low `width` bits.
///
/// `width >= 64` yields all ones. A shift by 64 is never performed.
pub fn width_mask(width: u32) -> u64 {
    match width {
        0 => 0,
        w if w >= MAX_WIDTH => u64::MAX,
        w => (1u64 << w) - 1
    }
}

/// Zeroes all bits at or above `width`, returning the unsigned view of the value.
pub fn mask_to_width(value: i64, width: u32) -> u64 {
    value as u64 & width_mask(width)
}

/// Replicates bit `width - 1` into all higher bits, returning the signed view of the value.
///
/// Any bits at or above `width` in the input are discarded first,
/// so this also serves as "truncate to `width` bits".
pub fn sign_extend(value: i64, width: u32) -> i64 {
    match width {
        0 => 0,
        w if w >= MAX_WIDTH => value,
        w => {
            let shift = MAX_WIDTH - w;
            (value << shift) >> shift
        }
    }
}

/// Checks whether `value` can be stored in `width` bits.
///
/// Signed values are checked against `[-2^(w-1), 2^(w-1) - 1]`,
/// unsigned values against `[0, 2^w - 1]`.
pub fn fits(value: i64, width: u32, signed: bool) -> bool {
    let value = i128::from(value);
    match signed {
        true  => !overflows(value, width),
        false => value >= 0 && value <= i128::from(width_mask(width))
    }
}

/// Computes the position of the least significant bit of a bit range,
/// counted from the right.
///
/// The range is `num_bits` long and starts at bit `start`, where `start` is numbered
/// according to `indexing` within a value of `width` bits.
fn lsb_position(width: u32, start: u32, num_bits: u32, indexing: Indexing) -> u32 {
    match indexing {
        Indexing::FromRight => start,
        Indexing::FromLeft  => width.saturating_sub(start).saturating_sub(num_bits),
    }
}

/// Pulls `num_bits` bits starting at bit `start` out of `container`,
/// where `container` holds a value of `width` bits.
///
/// The result is unsigned (zero-extended).
///
/// The bit range `[start, start + num_bits)` must fit in `width`.
/// Machine validation guarantees this for every microinstruction.
pub fn extract_field(container: i64, width: u32, start: u32, num_bits: u32, indexing: Indexing) -> i64 {
    debug_assert!(start + num_bits <= width, "bit range {start}+{num_bits} does not fit in {width} bits");
    let lsb = lsb_position(width, start, num_bits, indexing);

    let shifted = (container as u64).checked_shr(lsb).unwrap_or(0);
    (shifted & width_mask(num_bits)) as i64
}

/// Overwrites `num_bits` bits starting at bit `start` of `container` with the
/// low bits of `field`, leaving all other bits unchanged.
///
/// See [`extract_field`] for how the range is interpreted.
pub fn insert_field(container: i64, field: i64, width: u32, start: u32, num_bits: u32, indexing: Indexing) -> i64 {
    debug_assert!(start + num_bits <= width, "bit range {start}+{num_bits} does not fit in {width} bits");
    let lsb = lsb_position(width, start, num_bits, indexing);

    let mask = width_mask(num_bits).checked_shl(lsb).unwrap_or(0);
    let bits = (field as u64 & width_mask(num_bits)).checked_shl(lsb).unwrap_or(0);
    ((container as u64 & !mask) | bits) as i64
}

/// Shifts a `width`-bit value by `distance` bits.
///
/// The result is in canonical (sign-extended) form.
///
/// Distances at or past the width are well-defined:
/// logical shifts and left arithmetic shifts produce 0,
/// right arithmetic shifts produce all sign bits,
/// and cyclic shifts wrap around (`distance % width`).
pub fn shift(value: i64, width: u32, kind: ShiftKind, direction: ShiftDirection, distance: u32) -> i64 {
    let mask = width_mask(width);
    let bits = mask_to_width(value, width);

    let result = match (kind, direction) {
        (ShiftKind::Logical | ShiftKind::Arithmetic, ShiftDirection::Left) => {
            bits.checked_shl(distance).unwrap_or(0)
        },
        (ShiftKind::Logical, ShiftDirection::Right) => {
            bits.checked_shr(distance).unwrap_or(0)
        },
        (ShiftKind::Arithmetic, ShiftDirection::Right) => {
            // i64 >> 63 already fills everything with the sign bit
            (sign_extend(value, width) >> distance.min(MAX_WIDTH - 1)) as u64
        },
        (ShiftKind::Cyclic, dir) => {
            let d = match width {
                0 => 0,
                w => distance % w
            };
            match (d, dir) {
                (0, _) => bits,
                (d, ShiftDirection::Left)  => (bits << d) | (bits >> (width - d)),
                (d, ShiftDirection::Right) => (bits >> d) | (bits << (width - d)),
            }
        }
    };

    sign_extend((result & mask) as i64, width)
}

/// Checks whether a wide result falls outside of `[-2^(w-1), 2^(w-1) - 1]`.
pub fn overflows(value: i128, width: u32) -> bool {
    let half = 1i128 << (width.clamp(1, MAX_WIDTH) - 1);
    value < -half || value > half - 1
}

/// Checks whether adding two `width`-bit values produces a carry out of the top bit.
///
/// Both operands must be in canonical (sign-extended) form.
/// The carry is detected with the sign rule: a carry occurs if both operands are negative,
/// or if one is negative and the other is at least its magnitude.
pub fn carries(a: i64, b: i64) -> bool {
    let (a, b) = (i128::from(a), i128::from(b));
    (a < 0 && b < 0) || (a < 0 && b >= -a) || (b < 0 && a >= -b)
}
