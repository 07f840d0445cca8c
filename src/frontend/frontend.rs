use std::rc::Rc;

use log::{debug, info};

use crate::cpu::{CODE_BASE, CPUConfig, INSTR_SIZE, PerfCounters, Trace};
use crate::instructions::instructions::{HALT, Instr, Opcode, Program, WordType};

/// The latch between fetch and decode.
#[derive(Clone, Debug)]
pub(crate) struct FetchLatch {
    pub(crate) pc: WordType,
    pub(crate) instr: Rc<Instr>,
}

/// The state of the frontend that the backend steers: the branch unit
/// redirects the PC and decode drains the decode latch.
pub(crate) struct FrontendControl {
    pub(crate) pc: WordType,
    pub(crate) halted: bool,
    // a control instruction is in flight; fetch waits till it is resolved
    pub(crate) control_hazard: bool,
    // a redirect happened; fetch skips a cycle
    pub(crate) fetch_from_next_cycle: bool,
    pub(crate) decode_latch: Option<FetchLatch>,
}

impl FrontendControl {
    pub(crate) fn new() -> Self {
        Self {
            pc: CODE_BASE,
            halted: false,
            control_hazard: false,
            fetch_from_next_cycle: false,
            decode_latch: None,
        }
    }

    /// Steers fetch to the target of a taken branch. Anything fetched after
    /// the branch is dropped.
    pub(crate) fn redirect(&mut self, target: WordType) {
        if let Some(latch) = self.decode_latch.take() {
            debug!("Frontend: flushing [{}] at pc={}", latch.instr, latch.pc);
        }
        self.pc = target;
        self.fetch_from_next_cycle = true;
    }
}

pub(crate) struct Frontend {
    program_option: Option<Rc<Program>>,
    trace: Trace,
}

impl Frontend {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Frontend {
        Frontend {
            program_option: None,
            trace: cpu_config.trace.clone(),
        }
    }

    pub(crate) fn init(&mut self, program: &Rc<Program>, frontend_control: &mut FrontendControl) {
        self.program_option = Some(Rc::clone(program));
        *frontend_control = FrontendControl::new();
    }

    pub(crate) fn do_cycle(&mut self, frontend_control: &mut FrontendControl, perf_counters: &mut PerfCounters) {
        let program = match &self.program_option {
            None => return,
            Some(program) => program,
        };

        if frontend_control.halted || frontend_control.control_hazard {
            return;
        }

        if frontend_control.fetch_from_next_cycle {
            frontend_control.fetch_from_next_cycle = false;
            return;
        }

        if frontend_control.decode_latch.is_some() {
            return;
        }

        let pc = frontend_control.pc;
        let instr = match program.get_instr(pc) {
            Some(instr) => instr,
            // fetching beyond the end of the code
            None => Rc::new(HALT),
        };

        if self.trace.fetch {
            info!("Fetched [{}] at pc={}", instr, pc);
        }

        if instr.is_control() {
            frontend_control.control_hazard = true;
        }
        if instr.opcode == Opcode::HALT {
            frontend_control.halted = true;
        }

        frontend_control.pc = pc + INSTR_SIZE;
        frontend_control.decode_latch = Some(FetchLatch { pc, instr });
        perf_counters.fetch_cnt += 1;
    }
}

#[cfg(test)]
mod tests {
    use crate::loader::loader::load_from_string;

    use super::*;

    fn frontend(src: &str) -> (Frontend, FrontendControl, PerfCounters) {
        let program = Rc::new(load_from_string(src).unwrap());
        let mut frontend = Frontend::new(&CPUConfig::default());
        let mut frontend_control = FrontendControl::new();
        frontend.init(&program, &mut frontend_control);
        (frontend, frontend_control, PerfCounters::new())
    }

    #[test]
    fn test_fetch_waits_for_decode_latch() {
        let (mut frontend, mut control, mut perf_counters) = frontend("MOVC R0,#1\nMOVC R1,#2\nHALT");

        frontend.do_cycle(&mut control, &mut perf_counters);
        assert_eq!(control.decode_latch.as_ref().map(|latch| latch.pc), Some(4000));
        assert_eq!(control.pc, 4004);

        frontend.do_cycle(&mut control, &mut perf_counters);
        assert_eq!(control.pc, 4004);
        assert_eq!(perf_counters.fetch_cnt, 1);
    }

    #[test]
    fn test_halt_stops_fetch() {
        let (mut frontend, mut control, mut perf_counters) = frontend("HALT\nMOVC R0,#1");

        frontend.do_cycle(&mut control, &mut perf_counters);
        assert!(control.halted);
        control.decode_latch = None;

        frontend.do_cycle(&mut control, &mut perf_counters);
        assert!(control.decode_latch.is_none());
        assert_eq!(perf_counters.fetch_cnt, 1);
    }

    #[test]
    fn test_implicit_halt_past_the_end() {
        let (mut frontend, mut control, mut perf_counters) = frontend("NOP");

        frontend.do_cycle(&mut control, &mut perf_counters);
        control.decode_latch = None;
        frontend.do_cycle(&mut control, &mut perf_counters);

        let latch = control.decode_latch.as_ref().unwrap();
        assert_eq!(latch.pc, 4004);
        assert_eq!(latch.instr.opcode, Opcode::HALT);
        assert!(control.halted);
    }

    #[test]
    fn test_control_instruction_blocks_fetch_until_redirect() {
        let (mut frontend, mut control, mut perf_counters) = frontend("JUMP R0,#4008\nNOP\nHALT");

        frontend.do_cycle(&mut control, &mut perf_counters);
        assert!(control.control_hazard);
        control.decode_latch = None;

        frontend.do_cycle(&mut control, &mut perf_counters);
        assert!(control.decode_latch.is_none());

        // the branch unit resolves the jump
        control.control_hazard = false;
        control.redirect(4008);

        // one bubble
        frontend.do_cycle(&mut control, &mut perf_counters);
        assert!(control.decode_latch.is_none());

        frontend.do_cycle(&mut control, &mut perf_counters);
        assert_eq!(control.decode_latch.as_ref().map(|latch| latch.pc), Some(4008));
    }
}
