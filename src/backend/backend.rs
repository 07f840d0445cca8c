use std::fmt;
use std::mem;
use std::rc::Rc;

use log::{debug, info};

use crate::backend::execution_unit::{EUTable, execute_branch, execute_int, execute_mul, FuResult, IntOutcome};
use crate::backend::issue_queue::{IQEntry, IssueQueue, SourceOperand};
use crate::backend::load_store_queue::{LSQ, LSQEntry, MemOpKind};
use crate::backend::physical_register::PhysRegFile;
use crate::backend::register_alias_table::RAT;
use crate::backend::reorder_buffer::{ROB, ROBSlotState};
use crate::cpu::{ARCH_REG_CNT, ArgRegFile, CPUConfig, Flags, PerfCounters, Trace};
use crate::error::SimError;
use crate::frontend::frontend::FrontendControl;
use crate::instructions::instructions::{ArchSource, FuClass, Instr, Opcode, Program, RegisterType, WordType};
use crate::memory_subsystem::memory_subsystem::{MemAccess, MemCompletion, MemorySubsystem};

/// The latch between decode/rename and dispatch. It participates in the
/// wakeup just like the issue queue, so a value forwarded while the
/// instruction waits here isn't lost.
pub(crate) struct RenameLatch {
    pub(crate) pc: WordType,
    pub(crate) instr: Rc<Instr>,
    pub(crate) src: [SourceOperand; 2],
    pub(crate) dest: Option<RegisterType>,
}

pub(crate) struct Backend {
    rename_latch: Option<RenameLatch>,
    issue_queue: IssueQueue,
    phys_reg_file: PhysRegFile,
    rat: RAT,
    rob: ROB,
    lsq: LSQ,
    eu_table: EUTable,
    trace: Trace,
    retire_n_wide: u8,
    // results produced in the previous cycle; broadcast at the start of this one
    cdb_broadcast_buffer: Vec<FuResult>,
    code_end: WordType,
    pub(crate) exit: bool,
}

impl Backend {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Backend {
        Backend {
            trace: cpu_config.trace.clone(),
            rename_latch: None,
            issue_queue: IssueQueue::new(cpu_config.iq_capacity),
            phys_reg_file: PhysRegFile::new(cpu_config.phys_reg_count),
            rat: RAT::new(ARCH_REG_CNT),
            rob: ROB::new(cpu_config.rob_capacity),
            lsq: LSQ::new(cpu_config.lsq_capacity),
            eu_table: EUTable::new(),
            retire_n_wide: cpu_config.retire_n_wide,
            // int, mul, branch and memory can each complete one instruction per cycle
            cdb_broadcast_buffer: Vec::with_capacity(4),
            code_end: 0,
            exit: false,
        }
    }

    pub(crate) fn init(&mut self, program: &Rc<Program>) {
        self.code_end = program.end_pc();
    }

    /// Runs the backend stages in reverse data flow order, so every stage
    /// sees the latch contents of the previous cycle.
    pub(crate) fn do_cycle(&mut self,
                           frontend_control: &mut FrontendControl,
                           memory_subsystem: &mut MemorySubsystem,
                           arch_reg_file: &mut ArgRegFile,
                           perf_counters: &mut PerfCounters) -> Result<(), SimError> {
        self.cycle_retire(arch_reg_file, perf_counters);
        if self.exit {
            return Ok(());
        }

        self.cdb_broadcast();
        self.cycle_memory(memory_subsystem)?;
        self.cycle_execute(frontend_control, perf_counters)?;
        self.cycle_issue(perf_counters);
        self.cycle_dispatch(perf_counters);
        self.cycle_decode(frontend_control, arch_reg_file, perf_counters);
        Ok(())
    }

    // Renames the instruction in the decode latch and moves it into the rename latch.
    fn cycle_decode(&mut self,
                    frontend_control: &mut FrontendControl,
                    arch_reg_file: &ArgRegFile,
                    perf_counters: &mut PerfCounters) {
        if self.rename_latch.is_some() {
            return;
        }

        let (pc, instr) = match &frontend_control.decode_latch {
            Some(latch) => (latch.pc, Rc::clone(&latch.instr)),
            None => return,
        };

        // The destination is allocated first; if there is no free register,
        // nothing has been modified and the same latch is retried next cycle.
        let dest = if instr.needs_phys_reg() {
            match self.phys_reg_file.allocate() {
                Some(phys_reg) => Some(phys_reg),
                None => {
                    debug!("Decode stalled on free physical register [{}] pc={}", instr, pc);
                    perf_counters.decode_stall_cnt += 1;
                    return;
                }
            }
        } else {
            None
        };

        // sources are renamed before the destination; ADD R1,R1,R2 reads the old R1
        let mut src = [SourceOperand::UNUSED; 2];
        for (index, source) in instr.sources().iter().enumerate() {
            if let Some(source) = source {
                src[index] = self.read_source(*source, arch_reg_file);
            }
        }

        if let Some(phys_reg) = dest {
            if let Some(arch_reg) = instr.rd {
                self.rat.rename(ArchSource::Register(arch_reg), phys_reg);
            }
            if instr.sets_flags() {
                self.rat.rename(ArchSource::Flags, phys_reg);
            }
        }

        if self.trace.decode {
            info!("Decoded [{}] pc={} src1={} src2={} dest={:?}", instr, pc, src[0], src[1], dest);
        }

        frontend_control.decode_latch = None;
        self.rename_latch = Some(RenameLatch { pc, instr, src, dest });
        perf_counters.decode_cnt += 1;
    }

    fn read_source(&self, source: ArchSource, arch_reg_file: &ArgRegFile) -> SourceOperand {
        let rat_entry = self.rat.get(source);
        if !rat_entry.valid {
            let value = match source {
                ArchSource::Register(arch_reg) => arch_reg_file.get_value(arch_reg),
                ArchSource::Flags => arch_reg_file.flags.as_value(),
            };
            return SourceOperand::ready(None, value);
        }

        let phys_reg = rat_entry.phys_reg;
        let phys_reg_entry = self.phys_reg_file.get(phys_reg);
        if phys_reg_entry.has_value {
            SourceOperand::ready(Some(phys_reg), phys_reg_entry.value)
        } else {
            // the forwarding of phys_reg will provide the value
            SourceOperand::pending(phys_reg)
        }
    }

    // Allocates the ROB slot, and if needed the issue queue and LSQ slots, for
    // the instruction in the rename latch. Either everything is allocated or nothing.
    fn cycle_dispatch(&mut self, perf_counters: &mut PerfCounters) {
        let latch = match self.rename_latch.take() {
            Some(latch) => latch,
            None => return,
        };

        let fu_class = latch.instr.fu_class();
        let is_memory = latch.instr.is_memory();

        if !self.rob.has_space()
            || (fu_class.is_some() && !self.issue_queue.has_free())
            || (is_memory && !self.lsq.has_space()) {
            debug!("Dispatch stalled [{}] pc={} rob={} iq={} lsq={}",
                   latch.instr, latch.pc, self.rob.size(), self.issue_queue.size(), self.lsq.size());
            perf_counters.dispatch_stall_cnt += 1;
            self.rename_latch = Some(latch);
            return;
        }

        let rob_index = self.rob.allocate();

        let lsq_index = if is_memory {
            let kind = if latch.instr.opcode == Opcode::LOAD { MemOpKind::LOAD } else { MemOpKind::STORE };
            Some(self.lsq.allocate(LSQEntry::new(kind, latch.pc, latch.dest, rob_index)))
        } else {
            None
        };

        let rob_slot = self.rob.get_mut(rob_index);
        rob_slot.instr = Some(Rc::clone(&latch.instr));
        rob_slot.pc = latch.pc;
        rob_slot.dest = latch.dest;
        rob_slot.result = 0;
        rob_slot.lsq_index = lsq_index;

        if self.trace.dispatch {
            info!("Dispatched [{}] pc={} rob={} lsq={:?}", latch.instr, latch.pc, rob_index, lsq_index);
        }

        match fu_class {
            Some(fu_class) => {
                rob_slot.state = ROBSlotState::DISPATCHED;
                self.issue_queue.allocate(IQEntry {
                    instr: latch.instr,
                    pc: latch.pc,
                    fu_class,
                    src: latch.src,
                    dest: latch.dest,
                    rob_index,
                    lsq_index,
                });
            }
            // NOP and HALT have nothing to execute
            None => rob_slot.state = ROBSlotState::EXECUTED,
        }

        perf_counters.dispatch_cnt += 1;
    }

    // For every functional unit that can accept an instruction, select the
    // first ready instruction of its class from the issue queue.
    fn cycle_issue(&mut self, perf_counters: &mut PerfCounters) {
        for fu_class in FuClass::ALL {
            if !self.eu_table.can_accept(fu_class) {
                continue;
            }

            let entry = match self.issue_queue.select(fu_class).and_then(|index| self.issue_queue.take(index)) {
                Some(entry) => entry,
                None => continue,
            };

            if self.trace.issue {
                info!("Issued [{}] pc={} to {} src1={} src2={}", entry.instr, entry.pc, fu_class, entry.src[0], entry.src[1]);
            }

            self.rob.get_mut(entry.rob_index).state = ROBSlotState::ISSUED;
            self.eu_table.accept(entry);
            perf_counters.issue_cnt += 1;
        }
    }

    fn cycle_execute(&mut self, frontend_control: &mut FrontendControl, perf_counters: &mut PerfCounters) -> Result<(), SimError> {
        if let Some(entry) = self.eu_table.int_unit.take() {
            let outcome = execute_int(&entry);
            if self.trace.execute {
                info!("Executed [{}] pc={} -> {:?}", entry.instr, entry.pc, outcome);
            }

            match outcome {
                IntOutcome::Value(value) => self.cdb_broadcast_buffer.push(FuResult::new(&entry, value)),
                IntOutcome::Address { address, data } => {
                    let lsq_entry = entry.lsq_index.and_then(|index| self.lsq.get_mut(index));
                    debug_assert!(lsq_entry.is_some(), "memory instruction [{}] without LSQ entry", entry.instr);
                    if let Some(lsq_entry) = lsq_entry {
                        lsq_entry.address = address;
                        lsq_entry.address_valid = true;
                        if let Some(data) = data {
                            lsq_entry.data = data;
                            lsq_entry.data_ready = true;
                        }
                    }
                }
            }
            perf_counters.execute_cnt += 1;
        }

        if let Some(entry) = self.eu_table.advance_mul() {
            let value = execute_mul(&entry)?;
            if self.trace.execute {
                info!("Executed [{}] pc={} -> {}", entry.instr, entry.pc, value);
            }
            self.cdb_broadcast_buffer.push(FuResult::new(&entry, value));
            perf_counters.execute_cnt += 1;
        }

        if let Some(entry) = self.eu_table.branch_unit.take() {
            let outcome = execute_branch(&entry, self.code_end)?;
            if self.trace.execute {
                info!("Executed [{}] pc={} -> {:?}", entry.instr, entry.pc, outcome);
            }

            frontend_control.control_hazard = false;
            if outcome.taken {
                debug!("Branch [{}] pc={} taken; redirecting fetch to {}", entry.instr, entry.pc, outcome.target);
                frontend_control.redirect(outcome.target);
                perf_counters.branch_taken_cnt += 1;
            }

            self.cdb_broadcast_buffer.push(FuResult::new(&entry, outcome.link.unwrap_or(0)));
            perf_counters.execute_cnt += 1;
        }

        Ok(())
    }

    // Starts the access of the LSQ head when possible and completes the
    // pending access.
    fn cycle_memory(&mut self, memory_subsystem: &mut MemorySubsystem) -> Result<(), SimError> {
        if memory_subsystem.is_idle() {
            let rob_head = self.rob.head_index();
            if let Some(head) = self.lsq.head_mut() {
                if head.can_access_memory(rob_head) {
                    let access = match head.kind {
                        MemOpKind::LOAD => MemAccess::Load { address: head.address },
                        MemOpKind::STORE => MemAccess::Store { address: head.address, value: head.data },
                    };
                    head.issued = true;
                    memory_subsystem.start(access, head.pc);
                }
            }
        }

        let completion = match memory_subsystem.do_cycle()? {
            Some(completion) => completion,
            None => return Ok(()),
        };

        let entry = match self.lsq.pop_head() {
            Some(entry) => entry,
            None => unreachable!("memory access completed without an LSQ entry"),
        };
        debug_assert!(entry.issued);

        match completion {
            MemCompletion::Loaded(value) => {
                self.cdb_broadcast_buffer.push(FuResult { pc: entry.pc, rob_index: entry.rob_index, dest: entry.dest, value });
            }
            MemCompletion::Stored => {
                self.rob.get_mut(entry.rob_index).state = ROBSlotState::EXECUTED;
            }
        }
        Ok(())
    }

    // Broadcasts the results of the previous cycle: writes the physical
    // registers, wakes up the waiting consumers and completes the ROB slots.
    fn cdb_broadcast(&mut self) {
        let results = mem::take(&mut self.cdb_broadcast_buffer);

        for result in &results {
            if let Some(phys_reg) = result.dest {
                self.phys_reg_file.write(phys_reg, result.value);
                self.issue_queue.wakeup(phys_reg, result.value);
                if let Some(latch) = &mut self.rename_latch {
                    for src in latch.src.iter_mut() {
                        src.wakeup(phys_reg, result.value);
                    }
                }
            }

            let rob_slot = self.rob.get_mut(result.rob_index);
            debug_assert!(rob_slot.state == ROBSlotState::ISSUED);
            rob_slot.result = result.value;
            rob_slot.state = ROBSlotState::EXECUTED;

            if self.trace.forward {
                match result.dest {
                    Some(phys_reg) => info!("Forwarded P{}={} pc={}", phys_reg, result.value, result.pc),
                    None => info!("Completed pc={}", result.pc),
                }
            }
        }

        self.cdb_broadcast_buffer = results;
        self.cdb_broadcast_buffer.clear();
    }

    fn cycle_retire(&mut self, arch_reg_file: &mut ArgRegFile, perf_counters: &mut PerfCounters) {
        for _ in 0..self.retire_n_wide {
            if !self.rob.head_has_executed() {
                break;
            }

            let rob_slot = self.rob.next_executed();
            let instr = match rob_slot.instr {
                Some(instr) => instr,
                None => unreachable!("executed ROB slot {} without instruction", rob_slot.index),
            };

            if self.trace.retire {
                info!("Retiring [{}] pc={} result={}", instr, rob_slot.pc, rob_slot.result);
            }

            if let Some(arch_reg) = instr.rd {
                arch_reg_file.set_value(arch_reg, rob_slot.result);
            }
            if instr.sets_flags() {
                arch_reg_file.flags = Flags::from_result(rob_slot.result);
            }

            // Every consumer has received the value by now; later readers
            // will find it in the architectural register file.
            if let Some(phys_reg) = rob_slot.dest {
                self.rat.release(phys_reg);
                self.phys_reg_file.deallocate(phys_reg);
            }

            perf_counters.retired_cnt += 1;

            if instr.opcode == Opcode::HALT {
                self.exit = true;
                break;
            }
        }
    }

    /// The physical registers that are neither free nor owned by an
    /// instruction in the rename latch or the ROB. Always 0.
    #[cfg(test)]
    pub(crate) fn leaked_phys_regs(&self) -> i64 {
        let mut held: Vec<RegisterType> = self.rob.in_flight().filter_map(|slot| slot.dest).collect();
        if let Some(dest) = self.rename_latch.as_ref().and_then(|latch| latch.dest) {
            held.push(dest);
        }
        held.sort();
        held.dedup();

        self.phys_reg_file.count() as i64 - self.phys_reg_file.free_count() as i64 - held.len() as i64
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rename_latch {
            Some(latch) => writeln!(f, "Rename latch: [{}] pc={} src1={} src2={} dest={:?}",
                                    latch.instr, latch.pc, latch.src[0], latch.src[1], latch.dest)?,
            None => writeln!(f, "Rename latch: -")?,
        }
        write!(f, "{}", self.rat)?;
        write!(f, "{}", self.phys_reg_file)?;
        write!(f, "{}", self.issue_queue)?;
        write!(f, "{}", self.eu_table)?;
        write!(f, "{}", self.rob)?;
        write!(f, "{}", self.lsq)
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::register_alias_table::RATEntry;
    use crate::frontend::frontend::FetchLatch;
    use crate::loader::loader::load_from_string;

    use super::*;

    struct Fixture {
        backend: Backend,
        frontend_control: FrontendControl,
        arch_reg_file: ArgRegFile,
        perf_counters: PerfCounters,
    }

    impl Fixture {
        fn new(cpu_config: CPUConfig) -> Self {
            Self {
                backend: Backend::new(&cpu_config),
                frontend_control: FrontendControl::new(),
                arch_reg_file: ArgRegFile::new(ARCH_REG_CNT),
                perf_counters: PerfCounters::new(),
            }
        }

        fn present(&mut self, src: &str, pc: WordType) {
            let program = load_from_string(src).unwrap();
            let instr = Rc::clone(&program.code[0]);
            self.frontend_control.decode_latch = Some(FetchLatch { pc, instr });
        }

        fn decode(&mut self) {
            self.backend.cycle_decode(&mut self.frontend_control, &self.arch_reg_file, &mut self.perf_counters);
        }

        fn dispatch(&mut self) {
            self.backend.cycle_dispatch(&mut self.perf_counters);
        }
    }

    #[test]
    fn test_rename_reads_old_mapping_of_destination() {
        let mut fixture = Fixture::new(CPUConfig::default());
        fixture.arch_reg_file.set_value(1, 5);

        fixture.present("ADD R1,R1,R1", 4000);
        fixture.decode();

        let latch = fixture.backend.rename_latch.as_ref().unwrap();
        assert_eq!(latch.src, [SourceOperand::ready(None, 5), SourceOperand::ready(None, 5)]);
        let dest = latch.dest.unwrap();
        assert_eq!(*fixture.backend.rat.get(ArchSource::Register(1)), RATEntry { phys_reg: dest, valid: true });
        assert!(fixture.backend.rat.get(ArchSource::Flags).valid);
        assert!(fixture.frontend_control.decode_latch.is_none());
    }

    #[test]
    fn test_dependent_source_waits_for_tag() {
        let mut fixture = Fixture::new(CPUConfig::default());

        fixture.present("MOVC R2,#7", 4000);
        fixture.decode();
        let producer = fixture.backend.rename_latch.as_ref().unwrap().dest.unwrap();
        fixture.dispatch();

        fixture.present("SUBL R3,R2,#1", 4004);
        fixture.decode();
        let latch = fixture.backend.rename_latch.as_ref().unwrap();
        assert_eq!(latch.src[0], SourceOperand::pending(producer));
        assert_eq!(latch.src[1], SourceOperand::UNUSED);

        // the result is forwarded while the consumer still sits in the rename latch
        fixture.backend.cdb_broadcast_buffer.push(FuResult { pc: 4000, rob_index: 0, dest: Some(producer), value: 7 });
        fixture.backend.rob.get_mut(0).state = ROBSlotState::ISSUED;
        fixture.backend.cdb_broadcast();

        let latch = fixture.backend.rename_latch.as_ref().unwrap();
        assert_eq!(latch.src[0], SourceOperand::ready(Some(producer), 7));
    }

    #[test]
    fn test_decode_stall_has_no_side_effects() {
        let cpu_config = CPUConfig { phys_reg_count: 1, ..CPUConfig::default() };
        let mut fixture = Fixture::new(cpu_config);

        fixture.present("MOVC R1,#1", 4000);
        fixture.decode();
        fixture.dispatch();

        fixture.present("MOVC R2,#2", 4004);
        let rat_before = fixture.backend.rat.table.clone();
        let cc_before = fixture.backend.rat.cc;

        fixture.decode();
        fixture.decode();

        assert_eq!(fixture.perf_counters.decode_stall_cnt, 2);
        assert!(fixture.backend.rename_latch.is_none());
        assert_eq!(fixture.frontend_control.decode_latch.as_ref().map(|latch| latch.pc), Some(4004));
        assert_eq!(fixture.backend.rat.table, rat_before);
        assert_eq!(fixture.backend.rat.cc, cc_before);
        assert_eq!(fixture.backend.phys_reg_file.free_count(), 0);
        assert_eq!(fixture.backend.leaked_phys_regs(), 0);
    }

    #[test]
    fn test_dispatch_is_all_or_nothing() {
        let cpu_config = CPUConfig { lsq_capacity: 1, ..CPUConfig::default() };
        let mut fixture = Fixture::new(cpu_config);

        fixture.present("LOAD R1,R0,#0", 4000);
        fixture.decode();
        fixture.dispatch();
        assert_eq!(fixture.backend.rob.size(), 1);
        assert_eq!(fixture.backend.issue_queue.size(), 1);

        fixture.present("STORE R1,R0,#1", 4004);
        fixture.decode();
        fixture.dispatch();

        // no LSQ space: neither the ROB nor the issue queue got an entry
        assert_eq!(fixture.perf_counters.dispatch_stall_cnt, 1);
        assert_eq!(fixture.backend.rob.size(), 1);
        assert_eq!(fixture.backend.issue_queue.size(), 1);
        assert!(fixture.backend.rename_latch.is_some());

        // once the LSQ has room the store goes through
        fixture.backend.lsq.pop_head();
        fixture.dispatch();
        assert_eq!(fixture.backend.rob.size(), 2);
        assert!(fixture.backend.rename_latch.is_none());
    }

    #[test]
    fn test_nop_completes_at_dispatch() {
        let mut fixture = Fixture::new(CPUConfig::default());
        fixture.present("NOP", 4000);
        fixture.decode();
        assert_eq!(fixture.backend.rename_latch.as_ref().unwrap().dest, None);
        fixture.dispatch();

        assert_eq!(fixture.backend.issue_queue.size(), 0);
        assert!(fixture.backend.rob.head_has_executed());
    }

    #[test]
    fn test_branch_reads_committed_flags() {
        let mut fixture = Fixture::new(CPUConfig::default());
        fixture.arch_reg_file.flags = Flags { zero: true, positive: false };

        fixture.present("BZ #8", 4000);
        fixture.decode();

        let latch = fixture.backend.rename_latch.as_ref().unwrap();
        assert_eq!(latch.src[0], SourceOperand::ready(None, 0));
        assert_eq!(latch.dest, None);
    }

    #[test]
    fn test_movc_renames_flags_but_div_does_not() {
        let mut fixture = Fixture::new(CPUConfig::default());

        fixture.present("MOVC R1,#0", 4000);
        fixture.decode();
        let movc_dest = fixture.backend.rename_latch.as_ref().unwrap().dest.unwrap();
        assert_eq!(*fixture.backend.rat.get(ArchSource::Flags), RATEntry { phys_reg: movc_dest, valid: true });
        fixture.dispatch();

        fixture.present("DIV R2,R1,R1", 4004);
        fixture.decode();
        let div_dest = fixture.backend.rename_latch.as_ref().unwrap().dest.unwrap();
        assert_ne!(div_dest, movc_dest);
        assert_eq!(*fixture.backend.rat.get(ArchSource::Register(2)), RATEntry { phys_reg: div_dest, valid: true });
        assert_eq!(*fixture.backend.rat.get(ArchSource::Flags), RATEntry { phys_reg: movc_dest, valid: true });
    }
}
