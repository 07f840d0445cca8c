use std::fmt;
use std::rc::Rc;

use crate::instructions::instructions::{Instr, RegisterType, WordType};

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum ROBSlotState {
    UNUSED,
    // waiting in the issue queue
    DISPATCHED,
    // handed to a functional unit
    ISSUED,
    // the result is available; the instruction can retire
    EXECUTED,
}

pub(crate) struct ROBSlot {
    pub(crate) instr: Option<Rc<Instr>>,
    pub(crate) pc: WordType,
    pub(crate) state: ROBSlotState,
    pub(crate) index: u16,
    // the physical register holding the result
    pub(crate) dest: Option<RegisterType>,
    pub(crate) result: WordType,
    pub(crate) lsq_index: Option<u16>,
}

impl ROBSlot {
    fn reset(&mut self) {
        self.instr = None;
        self.pc = 0;
        self.state = ROBSlotState::UNUSED;
        self.dest = None;
        self.result = 0;
        self.lsq_index = None;
    }
}

pub(crate) struct ROB {
    capacity: u16,
    // everything before this point is retired.
    head: u64,
    tail: u64,
    slots: Vec<ROBSlot>,
}

impl ROB {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        for k in 0..capacity {
            slots.push(ROBSlot {
                index: k,
                instr: None,
                pc: 0,
                state: ROBSlotState::UNUSED,
                dest: None,
                result: 0,
                lsq_index: None,
            });
        }

        Self {
            capacity,
            tail: 0,
            head: 0,
            slots,
        }
    }

    fn to_index(&self, seq: u64) -> u16 {
        (seq % self.capacity as u64) as u16
    }

    pub(crate) fn get_mut(&mut self, slot_index: u16) -> &mut ROBSlot {
        &mut self.slots[slot_index as usize]
    }

    pub(crate) fn allocate(&mut self) -> u16 {
        assert!(self.has_space(), "ROB: Can't allocate if no space.");

        let index = self.to_index(self.tail);
        self.tail += 1;
        index
    }

    /// The slot of the oldest in flight instruction.
    pub(crate) fn head_index(&self) -> Option<u16> {
        if self.head == self.tail {
            None
        } else {
            Some(self.to_index(self.head))
        }
    }

    pub(crate) fn head_has_executed(&self) -> bool {
        match self.head_index() {
            Some(index) => self.slots[index as usize].state == ROBSlotState::EXECUTED,
            None => false,
        }
    }

    /// Removes the head; the caller has checked it executed. The slot is
    /// handed back by value so it can be retired.
    pub(crate) fn next_executed(&mut self) -> ROBSlot {
        assert!(self.head_has_executed(), "ROB: can't next_executed because there are no slots in executed state");

        let index = self.to_index(self.head);
        self.head += 1;

        let slot = &mut self.slots[index as usize];
        let retired = ROBSlot {
            instr: slot.instr.take(),
            pc: slot.pc,
            state: slot.state,
            index: slot.index,
            dest: slot.dest,
            result: slot.result,
            lsq_index: slot.lsq_index,
        };
        slot.reset();
        retired
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn has_space(&self) -> bool {
        self.capacity > self.size()
    }

    /// The occupied slots from oldest to youngest.
    pub(crate) fn in_flight(&self) -> impl Iterator<Item = &ROBSlot> + '_ {
        (self.head..self.tail).map(move |seq| &self.slots[self.to_index(seq) as usize])
    }
}

impl fmt::Display for ROB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Reorder buffer ({}/{}):", self.size(), self.capacity)?;
        for slot in self.in_flight() {
            if let Some(instr) = &slot.instr {
                write!(f, "  [{}] pc={} {:<20} {:?}", slot.index, slot.pc, instr.to_string(), slot.state)?;
                if let Some(dest) = slot.dest {
                    write!(f, " dest=P{}", dest)?;
                }
                if slot.state == ROBSlotState::EXECUTED {
                    write!(f, " result={}", slot.result)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::instructions::instructions::HALT;

    use super::*;

    fn dispatch(rob: &mut ROB, pc: WordType) -> u16 {
        let index = rob.allocate();
        let slot = rob.get_mut(index);
        slot.instr = Some(Rc::new(HALT));
        slot.pc = pc;
        slot.state = ROBSlotState::DISPATCHED;
        index
    }

    #[test]
    fn test_retires_in_dispatch_order() {
        let mut rob = ROB::new(4);
        let first = dispatch(&mut rob, 4000);
        let second = dispatch(&mut rob, 4004);

        // the younger one completes first, but can't pass the head
        rob.get_mut(second).state = ROBSlotState::EXECUTED;
        assert!(!rob.head_has_executed());

        rob.get_mut(first).state = ROBSlotState::EXECUTED;
        assert_eq!(rob.next_executed().pc, 4000);
        assert_eq!(rob.next_executed().pc, 4004);
        assert_eq!(rob.head_index(), None);
        assert_eq!(rob.get_mut(first).state, ROBSlotState::UNUSED);
    }

    #[test]
    fn test_capacity_and_wrap_around() {
        let mut rob = ROB::new(2);
        for round in 0..5 {
            let index = dispatch(&mut rob, 4000 + round * 4);
            assert_eq!(index as WordType, round % 2);
            rob.get_mut(index).state = ROBSlotState::EXECUTED;
            assert!(rob.has_space());
            rob.next_executed();
        }

        dispatch(&mut rob, 5000);
        dispatch(&mut rob, 5004);
        assert!(!rob.has_space());
        let pcs: Vec<WordType> = rob.in_flight().map(|slot| slot.pc).collect();
        assert_eq!(pcs, vec![5000, 5004]);
    }
}
