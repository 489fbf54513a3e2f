//! Change observers, which record which hardware modules were accessed
//! since the observer was last cleared.
//!
//! A user interface reads the [`Machine::observer`] field after a run or a step
//! to highlight the registers and memory cells that changed, instead of diffing
//! the entire machine state.
//!
//! [`Machine::observer`]: crate::machine::Machine::observer

use std::collections::BTreeMap;

use super::hw::{RamId, RegRef};

/// The set of accesses which have occurred at a register or memory location.
///
/// ## Example
///
/// ```
/// # use cpusim_engine::machine::observer::AccessSet;
///
/// let accesses = AccessSet::READ | AccessSet::WRITTEN;
/// assert!(accesses.accessed());
/// assert!(accesses.read());
/// assert!(accesses.written());
/// assert!(!accesses.modified());
/// ```
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct AccessSet(u8);
impl AccessSet {
    /// Set with only the read flag enabled.
    pub const READ: Self = Self(1 << 0);
    /// Set with only the write flag enabled.
    pub const WRITTEN: Self = Self(1 << 1);
    /// Set with only the modify flag enabled.
    pub const MODIFIED: Self = Self(1 << 2);

    /// True if any access has occurred.
    pub fn accessed(&self) -> bool {
        self.0 != 0
    }
    /// True if a read has occurred.
    pub fn read(&self) -> bool {
        self.0 & Self::READ.0 != 0
    }
    /// True if a write has occurred (does not necessarily have to change data).
    pub fn written(&self) -> bool {
        self.0 & Self::WRITTEN.0 != 0
    }
    /// True if a write has occurred (data must change).
    pub fn modified(&self) -> bool {
        self.0 & Self::MODIFIED.0 != 0
    }

    /// The access set for a write which replaced `old` with `new`.
    pub(crate) fn write(old: i64, new: i64) -> Self {
        match old == new {
            true  => Self::WRITTEN,
            false => Self::WRITTEN | Self::MODIFIED
        }
    }
}
impl std::ops::BitOr for AccessSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
impl std::ops::BitOrAssign for AccessSet {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}
impl std::fmt::Debug for AccessSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessSet")
            .field("read", &self.read())
            .field("written", &self.written())
            .field("modified", &self.modified())
            .finish()
    }
}

/// Tracks accesses to registers, register array elements, and RAM cells.
#[derive(Debug, Default)]
pub struct ChangeObserver {
    regs: BTreeMap<RegRef, AccessSet>,
    mem: BTreeMap<(RamId, usize), AccessSet>
}
impl ChangeObserver {
    /// Creates a new change observer.
    pub fn new() -> Self {
        Default::default()
    }

    /// Clears all accesses.
    pub fn clear(&mut self) {
        std::mem::take(self);
    }

    /// Gets the access set for the given register (or register array element).
    pub fn get_reg_accesses(&self, reg: RegRef) -> AccessSet {
        self.regs.get(&reg).copied().unwrap_or_default()
    }
    /// Adds new flags to the access set for the given register.
    pub fn update_reg_accesses(&mut self, reg: RegRef, set: AccessSet) {
        *self.regs.entry(reg).or_default() |= set;
    }
    /// Takes all register accesses which have occurred since last clear,
    /// as well as clearing register accesses.
    pub fn take_reg_accesses(&mut self) -> impl Iterator<Item=(RegRef, AccessSet)> {
        std::mem::take(&mut self.regs).into_iter()
    }

    /// Gets the access set for the given memory cell.
    pub fn get_mem_accesses(&self, ram: RamId, addr: usize) -> AccessSet {
        self.mem.get(&(ram, addr)).copied().unwrap_or_default()
    }
    /// Adds new flags to the access set for the given memory cell.
    pub fn update_mem_accesses(&mut self, ram: RamId, addr: usize, set: AccessSet) {
        *self.mem.entry((ram, addr)).or_default() |= set;
    }
    /// Takes all memory accesses which have occurred since last clear,
    /// as well as clearing memory accesses.
    ///
    /// This iterator is sorted by RAM, then by address.
    pub fn take_mem_accesses(&mut self) -> impl Iterator<Item=((RamId, usize), AccessSet)> {
        std::mem::take(&mut self.mem).into_iter()
    }
}
