use std::fmt;

use crate::instructions::instructions::{RegisterType, WordType};

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum MemOpKind {
    LOAD,
    STORE,
}

#[derive(Clone, Debug)]
pub(crate) struct LSQEntry {
    pub(crate) kind: MemOpKind,
    pub(crate) pc: WordType,
    pub(crate) address: WordType,
    pub(crate) address_valid: bool,
    pub(crate) data: WordType,
    pub(crate) data_ready: bool,
    // the physical register a load writes
    pub(crate) dest: Option<RegisterType>,
    pub(crate) rob_index: u16,
    // sent to the memory unit
    pub(crate) issued: bool,
}

impl LSQEntry {
    pub(crate) fn new(kind: MemOpKind, pc: WordType, dest: Option<RegisterType>, rob_index: u16) -> Self {
        Self {
            kind,
            pc,
            address: 0,
            address_valid: false,
            data: 0,
            data_ready: false,
            dest,
            rob_index,
            issued: false,
        }
    }

    /// A load may access memory as soon as its address is known. A store
    /// additionally needs its data and has to be the oldest instruction in
    /// flight, so it never becomes visible before older instructions retired.
    pub(crate) fn can_access_memory(&self, rob_head: Option<u16>) -> bool {
        if self.issued || !self.address_valid {
            return false;
        }

        match self.kind {
            MemOpKind::LOAD => true,
            MemOpKind::STORE => self.data_ready && rob_head == Some(self.rob_index),
        }
    }
}

/// The load store queue keeps the memory instructions in program order.
/// Only the head can access memory.
pub(crate) struct LSQ {
    capacity: u16,
    head: u64,
    tail: u64,
    slots: Vec<Option<LSQEntry>>,
}

impl LSQ {
    pub(crate) fn new(capacity: u16) -> Self {
        Self { capacity, head: 0, tail: 0, slots: vec![None; capacity as usize] }
    }

    fn to_index(&self, seq: u64) -> u16 {
        (seq % self.capacity as u64) as u16
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn has_space(&self) -> bool {
        self.capacity > self.size()
    }

    pub(crate) fn allocate(&mut self, entry: LSQEntry) -> u16 {
        assert!(self.has_space(), "LSQ: Can't allocate if no space.");

        let index = self.to_index(self.tail);
        self.slots[index as usize] = Some(entry);
        self.tail += 1;
        index
    }

    pub(crate) fn get_mut(&mut self, index: u16) -> Option<&mut LSQEntry> {
        self.slots[index as usize].as_mut()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut LSQEntry> {
        if self.head == self.tail {
            return None;
        }
        let index = self.to_index(self.head);
        self.get_mut(index)
    }

    pub(crate) fn pop_head(&mut self) -> Option<LSQEntry> {
        if self.head == self.tail {
            return None;
        }
        let index = self.to_index(self.head);
        self.head += 1;
        self.slots[index as usize].take()
    }
}

impl fmt::Display for LSQ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Load store queue ({}/{}):", self.size(), self.capacity)?;
        for seq in self.head..self.tail {
            let index = self.to_index(seq);
            if let Some(entry) = &self.slots[index as usize] {
                write!(f, "  [{}] {:?} pc={}", index, entry.kind, entry.pc)?;
                if entry.address_valid {
                    write!(f, " addr={}", entry.address)?;
                } else {
                    write!(f, " addr=?")?;
                }
                if entry.kind == MemOpKind::STORE {
                    if entry.data_ready {
                        write!(f, " data={}", entry.data)?;
                    } else {
                        write!(f, " data=?")?;
                    }
                }
                writeln!(f, " rob={}{}", entry.rob_index, if entry.issued { " issued" } else { "" })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut lsq = LSQ::new(2);
        let first = lsq.allocate(LSQEntry::new(MemOpKind::LOAD, 4000, Some(1), 0));
        let second = lsq.allocate(LSQEntry::new(MemOpKind::STORE, 4004, None, 1));
        assert!(!lsq.has_space());

        lsq.get_mut(second).unwrap().address_valid = true;
        assert_eq!(lsq.pop_head().unwrap().pc, 4000);
        assert_eq!(lsq.head_mut().unwrap().pc, 4004);
        assert_eq!(lsq.pop_head().unwrap().pc, 4004);
        assert!(lsq.pop_head().is_none());
        assert_ne!(first, second);
    }

    #[test]
    fn test_load_needs_address() {
        let mut load = LSQEntry::new(MemOpKind::LOAD, 4000, Some(1), 3);
        assert!(!load.can_access_memory(Some(0)));
        load.address_valid = true;
        assert!(load.can_access_memory(Some(0)));
        load.issued = true;
        assert!(!load.can_access_memory(Some(0)));
    }

    #[test]
    fn test_store_waits_for_rob_head() {
        let mut store = LSQEntry::new(MemOpKind::STORE, 4000, None, 3);
        store.address_valid = true;
        assert!(!store.can_access_memory(Some(3)));

        store.data_ready = true;
        assert!(!store.can_access_memory(Some(2)));
        assert!(store.can_access_memory(Some(3)));
    }
}
