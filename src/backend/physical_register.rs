use std::fmt;

use crate::instructions::instructions::{RegisterType, WordType};

/// The pool of free physical registers. It is a circular queue: registers
/// are handed out at the head and returned at the tail, so a released
/// register is reused as late as possible.
pub(crate) struct FreeList {
    capacity: u16,
    head: u64,
    tail: u64,
    slots: Vec<RegisterType>,
}

impl FreeList {
    pub(crate) fn new(capacity: u16) -> Self {
        let slots = (0..capacity).collect();
        Self { capacity, head: 0, tail: capacity as u64, slots }
    }

    fn to_index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub(crate) fn is_full(&self) -> bool {
        self.size() == self.capacity
    }

    pub(crate) fn pop(&mut self) -> Option<RegisterType> {
        if self.is_empty() {
            return None;
        }

        let reg = self.slots[self.to_index(self.head)];
        self.head += 1;
        Some(reg)
    }

    pub(crate) fn push(&mut self, reg: RegisterType) {
        debug_assert!(!self.is_full(), "FreeList: can't push {} on a full free list", reg);
        debug_assert!(!self.contains(reg), "FreeList: phys register {} is already free", reg);

        let index = self.to_index(self.tail);
        self.slots[index] = reg;
        self.tail += 1;
    }

    pub(crate) fn contains(&self, reg: RegisterType) -> bool {
        (self.head..self.tail).any(|seq| self.slots[self.to_index(seq)] == reg)
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum PhysRegEntryState {
    IDLE,
    BUSY,
}

pub(crate) struct PhysRegEntry {
    pub(crate) value: WordType,
    pub(crate) has_value: bool,
    pub(crate) state: PhysRegEntryState,
}

impl PhysRegEntry {
    fn reset(&mut self) {
        self.value = 0;
        self.has_value = false;
        self.state = PhysRegEntryState::IDLE;
    }
}

pub(crate) struct PhysRegFile {
    free_list: FreeList,
    entries: Vec<PhysRegEntry>,
}

impl PhysRegFile {
    pub(crate) fn new(count: u16) -> PhysRegFile {
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(PhysRegEntry {
                value: 0,
                has_value: false,
                state: PhysRegEntryState::IDLE,
            });
        }

        PhysRegFile { free_list: FreeList::new(count), entries }
    }

    pub(crate) fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    pub(crate) fn free_count(&self) -> u16 {
        self.free_list.size()
    }

    pub(crate) fn get(&self, reg: RegisterType) -> &PhysRegEntry {
        let entry = &self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::BUSY, "phys register {} is not in busy state", reg);
        entry
    }

    /// Takes a register from the free list. Returns None when all registers
    /// are in use; the caller stalls.
    pub(crate) fn allocate(&mut self) -> Option<RegisterType> {
        let reg = self.free_list.pop()?;
        let entry = &mut self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::IDLE);
        debug_assert!(!entry.has_value, "The allocated physical register {} should not have a value", reg);
        entry.state = PhysRegEntryState::BUSY;
        Some(reg)
    }

    /// Writes the result of the producing instruction; a phys register gets
    /// its value exactly once.
    pub(crate) fn write(&mut self, reg: RegisterType, value: WordType) {
        let entry = &mut self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::BUSY, "phys register {} is not in busy state", reg);
        debug_assert!(!entry.has_value, "phys register {} is written twice", reg);
        entry.value = value;
        entry.has_value = true;
    }

    pub(crate) fn deallocate(&mut self, reg: RegisterType) {
        let entry = &mut self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::BUSY);
        entry.reset();
        self.free_list.push(reg);
    }
}

impl fmt::Display for PhysRegFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Physical registers (free {}/{}):", self.free_count(), self.count())?;
        for (reg, entry) in self.entries.iter().enumerate() {
            if entry.state == PhysRegEntryState::IDLE {
                continue;
            }

            if entry.has_value {
                writeln!(f, "  P{:<3} = {}", reg, entry.value)?;
            } else {
                writeln!(f, "  P{:<3} = <pending>", reg)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_allocate() {
        let mut regs = PhysRegFile::new(4);
        let reg = regs.allocate().unwrap();
        assert_eq!(reg, 0);
        assert_eq!(regs.get(reg).state, PhysRegEntryState::BUSY);
        assert!(!regs.get(reg).has_value);
        assert_eq!(regs.free_count(), 3);
    }

    #[test]
    fn test_exhaustion() {
        let mut regs = PhysRegFile::new(2);
        assert!(regs.allocate().is_some());
        assert!(regs.allocate().is_some());
        assert_eq!(regs.allocate(), None);
    }

    #[test]
    fn test_released_register_goes_to_the_tail() {
        let mut regs = PhysRegFile::new(3);
        let first = regs.allocate().unwrap();
        regs.write(first, 42);
        regs.deallocate(first);

        assert_eq!(regs.allocate(), Some(1));
        assert_eq!(regs.allocate(), Some(2));
        let reused = regs.allocate().unwrap();
        assert_eq!(reused, first);
        assert!(!regs.get(reused).has_value);
    }

    #[test]
    fn test_free_list_wraps_around() {
        let mut free_list = FreeList::new(2);
        for _ in 0..10 {
            let reg = free_list.pop().unwrap();
            free_list.push(reg);
        }
        assert!(free_list.is_full());
        assert!(free_list.contains(0));
        assert!(free_list.contains(1));
    }

    proptest! {
        // Every register is either free or allocated, whatever the order of
        // allocations and releases.
        #[test]
        fn test_conservation(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
            let count = 8;
            let mut regs = PhysRegFile::new(count);
            let mut allocated: Vec<RegisterType> = Vec::new();

            for allocate in ops {
                if allocate {
                    if let Some(reg) = regs.allocate() {
                        prop_assert!(!allocated.contains(&reg));
                        allocated.push(reg);
                    } else {
                        prop_assert_eq!(allocated.len(), count as usize);
                    }
                } else if !allocated.is_empty() {
                    let reg = allocated.remove(0);
                    regs.deallocate(reg);
                }

                prop_assert_eq!(regs.free_count() as usize + allocated.len(), count as usize);
            }
        }
    }
}
