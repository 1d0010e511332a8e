//! Storage, scheduling and interpretation of compiled scripts (§4.5).
//!
//! Each running script owns its own OS thread; `stop` is a cooperative
//! flag checked at every branch and sleep, never a forced kill.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    chip::Chip,
    error::{Error, ErrorKind, Result},
    lcb::LineFlags,
    tx,
};

use super::parser::{Op, Operand, Program};
use super::{parse, CALL_STACK_DEPTH, NUM_PARAMS, NUM_VARS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    Initing,
    Ready,
    Running,
    Waiting,
    Halted,
    Failed,
}

struct Registers {
    vars: [i64; NUM_VARS],
    params: [i64; NUM_PARAMS],
}

pub struct Script {
    pub id: u32,
    pub source: String,
    program: Program,
    state: Mutex<ScriptState>,
    regs: Mutex<Registers>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Script {
    pub fn state(&self) -> ScriptState {
        *self.state.lock().unwrap()
    }

    pub fn params(&self) -> [i64; NUM_PARAMS] {
        self.regs.lock().unwrap().params
    }

    fn set_state(&self, s: ScriptState) {
        *self.state.lock().unwrap() = s;
    }
}

/// Owns every stored script for one chip context; `run` spawns a thread
/// per invocation that interprets the program against `chip`.
pub struct ScriptEngine {
    chip: Arc<Chip>,
    scripts: Mutex<Vec<Arc<Script>>>,
    next_id: Mutex<u32>,
}

impl ScriptEngine {
    pub fn new(chip: Arc<Chip>) -> Self {
        Self {
            chip,
            scripts: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
        }
    }

    pub fn store(&self, source: &str) -> Result<Arc<Script>> {
        let program = parse(source)?;
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        let script = Arc::new(Script {
            id,
            source: source.to_string(),
            program,
            state: Mutex::new(ScriptState::Ready),
            regs: Mutex::new(Registers {
                vars: [0; NUM_VARS],
                params: [0; NUM_PARAMS],
            }),
            stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        });
        self.scripts.lock().unwrap().push(script.clone());
        Ok(script)
    }

    pub fn get(&self, id: u32) -> Result<Arc<Script>> {
        self.scripts
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::BadHandle, "no such script"))
    }

    pub fn run(&self, id: u32, params: &[i64]) -> Result<()> {
        let script = self.get(id)?;
        if script.state() == ScriptState::Running {
            return Err(Error::new(ErrorKind::ScriptFailed, "script already running"));
        }
        {
            let mut regs = script.regs.lock().unwrap();
            for (i, &p) in params.iter().take(NUM_PARAMS).enumerate() {
                regs.params[i] = p;
            }
        }
        script.stop.store(false, Ordering::SeqCst);
        script.set_state(ScriptState::Running);

        let chip = self.chip.clone();
        let script_for_thread = script.clone();
        let handle = std::thread::spawn(move || {
            let result = interpret(&script_for_thread, &chip);
            script_for_thread.set_state(match result {
                Ok(()) => ScriptState::Halted,
                Err(e) => {
                    tracing::warn!(script = script_for_thread.id, error = %e, "script failed");
                    ScriptState::Failed
                }
            });
        });
        *script.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self, id: u32) -> Result<()> {
        let script = self.get(id)?;
        script.stop.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn status(&self, id: u32) -> Result<(ScriptState, [i64; NUM_PARAMS])> {
        let script = self.get(id)?;
        Ok((script.state(), script.params()))
    }

    pub fn update(&self, id: u32, params: &[i64]) -> Result<()> {
        let script = self.get(id)?;
        let mut regs = script.regs.lock().unwrap();
        for (i, &p) in params.iter().take(NUM_PARAMS).enumerate() {
            regs.params[i] = p;
        }
        Ok(())
    }

    pub fn delete(&self, id: u32) -> Result<()> {
        let script = self.get(id)?;
        script.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = script.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.scripts.lock().unwrap().retain(|s| s.id != id);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

fn interpret(script: &Script, chip: &Arc<Chip>) -> Result<()> {
    let mut pc = 0usize;
    let mut call_stack: Vec<usize> = Vec::with_capacity(CALL_STACK_DEPTH);

    loop {
        if script.stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(instr) = script.program.instructions.get(pc) else {
            return Ok(());
        };
        let mut next_pc = pc + 1;

        let mut regs = script.regs.lock().unwrap();
        macro_rules! resolve {
            ($op:expr) => {
                match $op {
                    Operand::Imm(v) => v,
                    Operand::Var(i) => regs.vars[i],
                    Operand::Param(i) => regs.params[i],
                }
            };
        }
        macro_rules! write_var {
            ($dst:expr, $val:expr) => {
                regs.vars[$dst] = $val
            };
        }
        // inr/dcr/jz/jnz/jm/jp can target a param slot directly, since
        // `status` hands params back to the caller and the lg original
        // decrements a script's own parameter in place (e.g. a countdown
        // loop driven by `p1` without a separate variable).
        macro_rules! reg_get {
            ($op:expr) => {
                match $op {
                    Operand::Var(i) => regs.vars[i],
                    Operand::Param(i) => regs.params[i],
                    Operand::Imm(_) => unreachable!("parser rejects immediate register operands"),
                }
            };
        }
        macro_rules! reg_set {
            ($op:expr, $val:expr) => {
                match $op {
                    Operand::Var(i) => regs.vars[i] = $val,
                    Operand::Param(i) => regs.params[i] = $val,
                    Operand::Imm(_) => unreachable!("parser rejects immediate register operands"),
                }
            };
        }

        match &instr.op {
            Op::Ld(dst, src) => write_var!(*dst, resolve!(*src)),
            Op::Add(dst, src) => regs.vars[*dst] += resolve!(*src),
            Op::Sub(dst, src) => regs.vars[*dst] -= resolve!(*src),
            Op::Mul(dst, src) => regs.vars[*dst] *= resolve!(*src),
            Op::Div(dst, src) => {
                let d = resolve!(*src);
                if d == 0 {
                    return Err(Error::new(ErrorKind::ScriptFailed, "division by zero"));
                }
                regs.vars[*dst] /= d;
            }
            Op::Mod(dst, src) => {
                let d = resolve!(*src);
                if d == 0 {
                    return Err(Error::new(ErrorKind::ScriptFailed, "modulo by zero"));
                }
                regs.vars[*dst] %= d;
            }
            Op::And(dst, src) => regs.vars[*dst] &= resolve!(*src),
            Op::Or(dst, src) => regs.vars[*dst] |= resolve!(*src),
            Op::Xor(dst, src) => regs.vars[*dst] ^= resolve!(*src),
            Op::Shl(dst, src) => regs.vars[*dst] <<= resolve!(*src),
            Op::Shr(dst, src) => regs.vars[*dst] >>= resolve!(*src),
            Op::Inr(dst) => reg_set!(*dst, reg_get!(*dst) + 1),
            Op::Dcr(dst) => reg_set!(*dst, reg_get!(*dst) - 1),
            Op::Tag(_) => {}
            Op::Jmp(t) => next_pc = target(&script.program, *t)?,
            Op::Jz(v, t) => {
                if reg_get!(*v) == 0 {
                    next_pc = target(&script.program, *t)?;
                }
            }
            Op::Jnz(v, t) => {
                if reg_get!(*v) != 0 {
                    next_pc = target(&script.program, *t)?;
                }
            }
            Op::Jm(v, t) => {
                if reg_get!(*v) < 0 {
                    next_pc = target(&script.program, *t)?;
                }
            }
            Op::Jp(v, t) => {
                if reg_get!(*v) > 0 {
                    next_pc = target(&script.program, *t)?;
                }
            }
            Op::Call(t) => {
                if call_stack.len() >= CALL_STACK_DEPTH {
                    return Err(Error::new(ErrorKind::ScriptFailed, "call stack overflow"));
                }
                call_stack.push(next_pc);
                next_pc = target(&script.program, *t)?;
            }
            Op::Ret => {
                next_pc = call_stack
                    .pop()
                    .ok_or_else(|| Error::new(ErrorKind::ScriptFailed, "return with empty call stack"))?;
            }
            Op::Halt => return Ok(()),
            Op::Mics(n) => {
                let us = resolve!(*n).max(0) as u64;
                drop(regs);
                sleep_cooperatively(script, Duration::from_micros(us));
                regs = script.regs.lock().unwrap();
            }
            Op::Mils(n) => {
                let ms = resolve!(*n).max(0) as u64;
                drop(regs);
                sleep_cooperatively(script, Duration::from_millis(ms));
                regs = script.regs.lock().unwrap();
            }
            Op::Wait(n) => {
                let us = resolve!(*n).max(0) as u64;
                drop(regs);
                sleep_cooperatively(script, Duration::from_micros(us));
                regs = script.regs.lock().unwrap();
            }
            Op::ClaimInput(line) => {
                let l = resolve!(*line) as u32;
                drop(regs);
                chip.claim_input(LineFlags::empty(), l)?;
                regs = script.regs.lock().unwrap();
            }
            Op::ClaimOutput(line, level) => {
                let l = resolve!(*line) as u32;
                let v = resolve!(*level) != 0;
                drop(regs);
                chip.claim_output(LineFlags::empty(), l, v)?;
                regs = script.regs.lock().unwrap();
            }
            Op::Free(line) => {
                let l = resolve!(*line) as u32;
                drop(regs);
                chip.free(l)?;
                regs = script.regs.lock().unwrap();
            }
            Op::Write(line, level) => {
                let l = resolve!(*line) as u32;
                let v = resolve!(*level) != 0;
                drop(regs);
                chip.write_level(l, v)?;
                regs = script.regs.lock().unwrap();
            }
            Op::Read(dst, line) => {
                let l = resolve!(*line) as u32;
                drop(regs);
                let level = chip.read_level(l)?;
                regs = script.regs.lock().unwrap();
                regs.vars[*dst] = level as i64;
            }
            Op::TxPulse(line, on, off, offset, cycles) => {
                let l = resolve!(*line) as u32;
                let on_us = resolve!(*on) as u32;
                let off_us = resolve!(*off) as u32;
                let offset_us = resolve!(*offset) as u32;
                let c = resolve!(*cycles) as u32;
                drop(regs);
                tx::tx_pulse(chip, l, on_us, off_us, offset_us, c)?;
                regs = script.regs.lock().unwrap();
            }
            Op::TxPwm(line, freq, duty, offset, cycles) => {
                let l = resolve!(*line) as u32;
                let freq_hz = resolve!(*freq) as u32;
                let duty_pct = resolve!(*duty) as u32;
                let offset_us = resolve!(*offset) as u32;
                let c = resolve!(*cycles) as u32;
                drop(regs);
                tx::tx_pwm(chip, l, freq_hz, duty_pct, offset_us, c)?;
                regs = script.regs.lock().unwrap();
            }
            Op::TxServo(line, pulse, freq, offset, cycles) => {
                let l = resolve!(*line) as u32;
                let pulse_us = resolve!(*pulse) as u32;
                let freq_hz = resolve!(*freq) as u32;
                let offset_us = resolve!(*offset) as u32;
                let c = resolve!(*cycles) as u32;
                drop(regs);
                tx::tx_servo(chip, l, pulse_us, freq_hz, offset_us, c)?;
                regs = script.regs.lock().unwrap();
            }
            Op::SetDebounce(line, us) => {
                let l = resolve!(*line) as u32;
                let d = resolve!(*us) as u64;
                drop(regs);
                chip.set_debounce(l, d)?;
                regs = script.regs.lock().unwrap();
            }
            Op::SetWatchdog(line, us) => {
                let l = resolve!(*line) as u32;
                let w = resolve!(*us) as u64;
                drop(regs);
                chip.set_watchdog(l, w)?;
                regs = script.regs.lock().unwrap();
            }
        }
        drop(regs);
        pc = next_pc;
    }
}

fn target(program: &Program, tag: u32) -> Result<usize> {
    program
        .labels
        .get(&tag)
        .copied()
        .ok_or_else(|| Error::new(ErrorKind::BadScript, format!("jump to undefined tag {tag}")))
}

/// Sleeps in short slices so `stop` is observed with bounded latency,
/// matching "checked at every branch and sleep" (§4.5, §5).
fn sleep_cooperatively(script: &Script, total: Duration) {
    const SLICE: Duration = Duration::from_millis(10);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if script.stop.load(Ordering::SeqCst) {
            return;
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::mock::mock_chip;
    use std::time::Duration;

    #[test]
    fn decrement_loop_runs_to_completion_and_zeroes_p1() {
        let chip = mock_chip(0, 32);
        let engine = ScriptEngine::new(chip);
        let script = engine.store("tag 0 dcr p1 mils 1 jmp 0").unwrap();
        // p1 starts at 0; dcr then jmp would loop forever on a negative
        // value, so seed p1 = 3 and stop the loop via a jz guard instead
        // for a script that actually halts.
        let halting = engine
            .store("tag 0 jz p1 1 dcr p1 mils 1 jmp 0 tag 1 halt")
            .unwrap();
        let _ = script;
        engine.update(halting.id, &[3]).unwrap();
        engine.run(halting.id, &[3]).unwrap();
        for _ in 0..200 {
            if halting.state() == ScriptState::Halted {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(halting.state(), ScriptState::Halted);
        assert_eq!(halting.params()[1], 0);
    }

    #[test]
    fn stop_flag_halts_a_sleeping_script() {
        let chip = mock_chip(0, 32);
        let engine = ScriptEngine::new(chip);
        let script = engine.store("tag 0 mils 5000 jmp 0").unwrap();
        engine.run(script.id, &[]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        engine.stop(script.id).unwrap();
        for _ in 0..200 {
            if script.state() != ScriptState::Running {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_ne!(script.state(), ScriptState::Running);
    }

    #[test]
    fn storing_then_deleting_leaves_script_count_unchanged() {
        let chip = mock_chip(0, 32);
        let engine = ScriptEngine::new(chip);
        let before = engine.count();
        let script = engine.store("halt").unwrap();
        engine.delete(script.id).unwrap();
        assert_eq!(engine.count(), before);
    }
}
