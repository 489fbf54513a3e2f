//! Backup history, used to undo execution.
//!
//! Every microinstruction executed while history is recorded pushes one [`Frame`]:
//! the control unit position before the microinstruction, and the old value of every
//! register and memory cell it wrote (plus any input it consumed).
//! Restoring a frame writes those old values back in reverse order.
//!
//! Output written to IO channels is not retracted.

use std::collections::VecDeque;

use super::control::Cursor;
use super::hw::{RamId, RegRef};
use super::io::{ChannelId, IoToken};

/// A single state change made by a microinstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Change {
    /// A register (or register array element) held `old` before the write.
    Register { reg: RegRef, old: i64 },
    /// A RAM cell held `old` before the write.
    Ram { ram: RamId, addr: usize, old: i64 },
    /// A value was consumed from a channel.
    Input { channel: ChannelId, token: IoToken }
}

/// The changes made by one microinstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) cursor: Cursor,
    pub(crate) changes: Vec<Change>
}
impl Frame {
    fn starts_cycle(&self) -> bool {
        self.cursor == Cursor::CYCLE_START
    }
}

/// The stack of backup frames.
#[derive(Debug, Default, Clone)]
pub struct BackupManager {
    frames: VecDeque<Frame>,
    limit: Option<usize>
}
impl BackupManager {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self { frames: VecDeque::new(), limit }
    }

    /// Sets the maximum number of frames kept, dropping the oldest frames if necessary.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
        self.evict(0);
    }
    fn evict(&mut self, room: usize) {
        if let Some(limit) = self.limit {
            while !self.frames.is_empty() && self.frames.len() + room > limit {
                self.frames.pop_front();
            }
        }
    }

    /// Starts a frame for a microinstruction that is about to execute at `cursor`.
    ///
    /// Returns the frame's change list, or `None` if the history limit is zero.
    pub(crate) fn begin(&mut self, cursor: Cursor) -> Option<&mut Vec<Change>> {
        if self.limit == Some(0) { return None };

        self.evict(1);
        self.frames.push_back(Frame { cursor, changes: vec![] });
        self.frames.back_mut().map(|f| &mut f.changes)
    }
    /// Drops the newest frame if it holds no changes.
    pub(crate) fn discard_if_empty(&mut self) {
        if self.frames.back().is_some_and(|f| f.changes.is_empty()) {
            self.frames.pop_back();
        }
    }

    /// Pops the newest frame.
    pub(crate) fn pop_micro(&mut self) -> Option<Frame> {
        self.frames.pop_back()
    }
    /// Pops every frame down to (and including) the newest frame that starts a machine cycle.
    ///
    /// Returns the popped frames, newest first. If no frame starts a cycle, nothing is popped.
    pub(crate) fn pop_machine_instr(&mut self) -> Vec<Frame> {
        let Some(start) = self.frames.iter().rposition(Frame::starts_cycle) else { return vec![] };
        self.frames.drain(start..).rev().collect()
    }
    /// Pops every frame, newest first.
    pub(crate) fn pop_all(&mut self) -> Vec<Frame> {
        self.frames.drain(..).rev().collect()
    }

    /// The number of frames (executed microinstructions) that can be undone.
    pub fn len(&self) -> usize {
        self.frames.len()
    }
    /// Whether there is no history.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
    /// Whether at least one microinstruction can be undone.
    pub fn can_backup_one_micro_instr(&self) -> bool {
        !self.frames.is_empty()
    }
    /// Whether the history reaches back to the start of a machine cycle.
    pub fn can_backup_one_machine_instr(&self) -> bool {
        self.frames.iter().any(Frame::starts_cycle)
    }
    /// Clears all history.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::control::Current;
    use crate::machine::hw::RegisterId;
    use crate::machine::instr::InstrId;

    fn at(current: Current, micro_index: usize) -> Cursor {
        Cursor { current, micro_index }
    }
    fn record(bm: &mut BackupManager, cursor: Cursor, old: i64) {
        if let Some(changes) = bm.begin(cursor) {
            changes.push(Change::Register { reg: RegRef::Register(RegisterId(0)), old });
        }
    }

    #[test]
    fn test_machine_instr_pops() {
        let mut bm = BackupManager::new(None);
        let add = Current::Instr(InstrId(0));

        record(&mut bm, at(Current::Fetch, 0), 0);
        record(&mut bm, at(Current::Fetch, 1), 1);
        record(&mut bm, at(add, 0), 2);
        record(&mut bm, at(Current::Fetch, 0), 3);
        record(&mut bm, at(Current::Fetch, 1), 4);
        assert_eq!(bm.len(), 5);
        assert!(bm.can_backup_one_machine_instr());

        let popped = bm.pop_machine_instr();
        assert_eq!(popped.len(), 2);
        assert_eq!(popped[0].cursor, at(Current::Fetch, 1));
        assert_eq!(popped[1].cursor, at(Current::Fetch, 0));

        let popped = bm.pop_machine_instr();
        assert_eq!(popped.len(), 3);
        assert!(bm.is_empty());
        assert!(!bm.can_backup_one_machine_instr());
        assert!(bm.pop_machine_instr().is_empty());
    }

    #[test]
    fn test_limit() {
        let mut bm = BackupManager::new(Some(2));
        record(&mut bm, at(Current::Fetch, 0), 0);
        record(&mut bm, at(Current::Fetch, 1), 1);
        record(&mut bm, at(Current::Fetch, 2), 2);
        assert_eq!(bm.len(), 2);
        assert!(!bm.can_backup_one_machine_instr());

        bm.set_limit(Some(1));
        assert_eq!(bm.len(), 1);
        assert_eq!(bm.pop_micro().map(|f| f.cursor), Some(at(Current::Fetch, 2)));

        bm.set_limit(Some(0));
        assert!(bm.begin(Cursor::CYCLE_START).is_none());
        assert!(!bm.can_backup_one_micro_instr());
    }

    #[test]
    fn test_discard_if_empty() {
        let mut bm = BackupManager::new(None);
        bm.begin(Cursor::CYCLE_START);
        bm.discard_if_empty();
        assert!(bm.is_empty());

        record(&mut bm, Cursor::CYCLE_START, 0);
        bm.discard_if_empty();
        assert_eq!(bm.len(), 1);
    }
}
