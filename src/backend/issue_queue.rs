use std::fmt;
use std::rc::Rc;

use crate::instructions::instructions::{FuClass, Instr, RegisterType, WordType};

/// A renamed source operand. When it isn't valid yet, the value will be
/// delivered by the forwarding of the physical register in `tag`.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct SourceOperand {
    pub(crate) tag: Option<RegisterType>,
    pub(crate) value: WordType,
    pub(crate) valid: bool,
}

impl SourceOperand {
    pub(crate) const UNUSED: SourceOperand = SourceOperand { tag: None, value: 0, valid: true };

    pub(crate) fn ready(tag: Option<RegisterType>, value: WordType) -> Self {
        Self { tag, value, valid: true }
    }

    pub(crate) fn pending(tag: RegisterType) -> Self {
        Self { tag: Some(tag), value: 0, valid: false }
    }

    /// Captures the forwarded value if this operand waits for `tag`.
    pub(crate) fn wakeup(&mut self, tag: RegisterType, value: WordType) -> bool {
        if self.valid || self.tag != Some(tag) {
            return false;
        }

        self.value = value;
        self.valid = true;
        true
    }
}

impl fmt::Display for SourceOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.tag, self.valid) {
            (None, _) => write!(f, "{}", self.value),
            (Some(tag), true) => write!(f, "P{}={}", tag, self.value),
            (Some(tag), false) => write!(f, "P{}=?", tag),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct IQEntry {
    pub(crate) instr: Rc<Instr>,
    pub(crate) pc: WordType,
    pub(crate) fu_class: FuClass,
    pub(crate) src: [SourceOperand; 2],
    pub(crate) dest: Option<RegisterType>,
    pub(crate) rob_index: u16,
    pub(crate) lsq_index: Option<u16>,
}

impl IQEntry {
    pub(crate) fn is_ready(&self) -> bool {
        self.src.iter().all(|src| src.valid)
    }
}

/// The issue queue holds dispatched instructions until their operands are
/// available. Slots are unordered; select picks the lowest ready slot.
pub(crate) struct IssueQueue {
    slots: Vec<Option<IQEntry>>,
}

impl IssueQueue {
    pub(crate) fn new(capacity: u16) -> Self {
        Self { slots: vec![None; capacity as usize] }
    }

    pub(crate) fn capacity(&self) -> u16 {
        self.slots.len() as u16
    }

    pub(crate) fn size(&self) -> u16 {
        self.slots.iter().filter(|slot| slot.is_some()).count() as u16
    }

    pub(crate) fn has_free(&self) -> bool {
        self.slots.iter().any(|slot| slot.is_none())
    }

    pub(crate) fn allocate(&mut self, entry: IQEntry) -> u16 {
        if let Some(index) = self.slots.iter().position(|slot| slot.is_none()) {
            self.slots[index] = Some(entry);
            index as u16
        } else {
            panic!("IssueQueue: can't allocate if no space.")
        }
    }

    /// The lowest slot holding a ready instruction for the given unit.
    pub(crate) fn select(&self, fu_class: FuClass) -> Option<u16> {
        self.slots.iter()
            .position(|slot| matches!(slot, Some(entry) if entry.fu_class == fu_class && entry.is_ready()))
            .map(|index| index as u16)
    }

    pub(crate) fn take(&mut self, index: u16) -> Option<IQEntry> {
        self.slots[index as usize].take()
    }

    pub(crate) fn wakeup(&mut self, tag: RegisterType, value: WordType) {
        for entry in self.slots.iter_mut().flatten() {
            for src in entry.src.iter_mut() {
                src.wakeup(tag, value);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, index: u16) -> Option<&IQEntry> {
        self.slots[index as usize].as_ref()
    }
}

impl fmt::Display for IssueQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Issue queue ({}/{}):", self.size(), self.capacity())?;
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(entry) = slot {
                write!(f, "  [{}] {} {:<20} src1={} src2={}", index, entry.fu_class, entry.instr.to_string(), entry.src[0], entry.src[1])?;
                if let Some(dest) = entry.dest {
                    write!(f, " dest=P{}", dest)?;
                }
                writeln!(f, " rob={}", entry.rob_index)?;
            }
        }
        Ok(())
    }
}
