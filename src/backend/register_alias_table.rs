use std::fmt;

use crate::instructions::instructions::{ArchSource, RegisterType};

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct RATEntry {
    pub(crate) phys_reg: RegisterType,
    // if not valid, the value needs to be read from the architectural register file
    pub(crate) valid: bool,
}

impl RATEntry {
    const UNMAPPED: RATEntry = RATEntry { phys_reg: 0, valid: false };
}

/// The Register Alias Table. This structure is used for the register
/// renaming process. The RAT entry for a given architectural register
/// points to the physical register to use. As long as such a entry
/// exists, it should be used.
///
/// Next to the general purpose registers there is an entry for the
/// condition codes; it points to the physical register of the youngest
/// flag producing instruction.
pub(crate) struct RAT {
    pub(crate) table: Vec<RATEntry>,
    pub(crate) cc: RATEntry,
}

impl RAT {
    pub fn new(arch_reg_count: u16) -> Self {
        Self { table: vec![RATEntry::UNMAPPED; arch_reg_count as usize], cc: RATEntry::UNMAPPED }
    }

    pub fn get(&self, source: ArchSource) -> &RATEntry {
        match source {
            ArchSource::Register(arch_reg) => &self.table[arch_reg as usize],
            ArchSource::Flags => &self.cc,
        }
    }

    /// Points the entry at a freshly allocated physical register. The old
    /// mapping is overwritten; in flight consumers keep their own tags.
    pub fn rename(&mut self, target: ArchSource, phys_reg: RegisterType) {
        let entry = match target {
            ArchSource::Register(arch_reg) => &mut self.table[arch_reg as usize],
            ArchSource::Flags => &mut self.cc,
        };
        entry.phys_reg = phys_reg;
        entry.valid = true;
    }

    /// Invalidates every entry that still points to the physical register;
    /// called when its producer retires.
    pub fn release(&mut self, phys_reg: RegisterType) {
        for entry in self.table.iter_mut().chain(std::iter::once(&mut self.cc)) {
            if entry.valid && entry.phys_reg == phys_reg {
                entry.valid = false;
            }
        }
    }
}

impl fmt::Display for RAT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RAT:")?;
        for (arch_reg, entry) in self.table.iter().enumerate() {
            if entry.valid {
                write!(f, " R{}->P{}", arch_reg, entry.phys_reg)?;
            }
        }
        if self.cc.valid {
            write!(f, " CC->P{}", self.cc.phys_reg)?;
        }
        writeln!(f)
    }
}
