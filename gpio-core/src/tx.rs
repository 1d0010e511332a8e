//! The transmission engine: one background thread per chip that advances
//! every claimed line's pulse/PWM/servo/wave state machine against a
//! deadline min-heap (§4.2).

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::Arc,
    time::Duration,
};

use crate::{
    chip::Chip,
    error::{Error, ErrorKind, Result},
    lcb::{TxKind, TxState, WaveStep, TX_ROOM_CAPACITY},
    time::now_ns,
};

pub const MIN_PWM_FREQ_HZ: u32 = 20;
pub const MAX_PWM_FREQ_HZ: u32 = 10_000;
pub const MIN_SERVO_FREQ_HZ: u32 = 40;
pub const MAX_SERVO_FREQ_HZ: u32 = 500;
pub const MIN_SERVO_PULSE_US: u32 = 500;
pub const MAX_SERVO_PULSE_US: u32 = 2500;

#[derive(PartialEq, Eq)]
struct Deadline {
    at: u64,
    line: u32,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.line.cmp(&other.line))
    }
}
impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Starts the per-chip transmission thread. The thread runs until
/// `Chip::shut_down` sets the chip's shutdown flag; it sleeps on the
/// chip's wake condvar, which every `tx_*`/`free`/`shut_down` call
/// notifies.
pub fn spawn(chip: Arc<Chip>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || run(chip))
}

fn run(chip: Arc<Chip>) {
    loop {
        if chip.is_shutting_down() {
            return;
        }
        let next_wait = {
            let state = chip.state.lock().unwrap();
            let mut heap: BinaryHeap<Reverse<Deadline>> = BinaryHeap::new();
            for group in state.groups.values() {
                for (pos, lcb) in group.lcbs.iter().enumerate() {
                    if let Some(at) = lcb.tx.next_deadline() {
                        heap.push(Reverse(Deadline {
                            at,
                            line: group.offsets[pos],
                        }));
                    }
                }
            }
            heap.pop()
        };
        match next_wait {
            None => {
                let state = chip.state.lock().unwrap();
                let _unused = chip
                    .wake
                    .wait_timeout(state, Duration::from_millis(200))
                    .unwrap();
            }
            Some(Reverse(deadline)) => {
                let now = now_ns() / 1000;
                if deadline.at > now {
                    let wait = Duration::from_micros(deadline.at - now);
                    let state = chip.state.lock().unwrap();
                    let _ = chip.wake.wait_timeout(state, wait).unwrap();
                } else {
                    advance_line(&chip, deadline.line);
                }
            }
        }
    }
}

/// Advances the named line's state machine by exactly one step, writing
/// through to the kernel group and computing its next deadline.
fn advance_line(chip: &Arc<Chip>, line: u32) {
    let mut state = chip.state.lock().unwrap();
    let Some((&first, _)) = state.groups.iter().find(|(_, g)| g.offsets.contains(&line)) else {
        return;
    };
    let group = state.groups.get_mut(&first).unwrap();
    let Some(pos) = group.offsets.iter().position(|&o| o == line) else {
        return;
    };
    let now_us = now_ns() / 1000;
    let lcb = &mut group.lcbs[pos];
    let (new_level, step_mask, step_bits, next) = match &mut lcb.tx {
        TxState::Idle => return,
        TxState::Pulse {
            on_us,
            off_us,
            cycles_remaining,
            phase,
            next_deadline,
            ..
        } => {
            let new_phase = !*phase;
            let dur = if new_phase { *on_us } else { *off_us };
            if !new_phase && *cycles_remaining != u32::MAX {
                *cycles_remaining -= 1;
            }
            let done = *cycles_remaining == 0 && !new_phase && *cycles_remaining != u32::MAX;
            *phase = new_phase;
            *next_deadline = now_us + dur as u64;
            let bit = 1u64 << pos;
            if done {
                lcb.tx = TxState::Idle;
                (new_phase, bit, if new_phase { bit } else { 0 }, None)
            } else {
                (new_phase, bit, if new_phase { bit } else { 0 }, Some(*next_deadline))
            }
        }
        TxState::Pwm {
            period_us,
            duty_us,
            cycles_remaining,
            phase,
            next_deadline,
            ..
        } => {
            let new_phase = !*phase;
            let dur = if new_phase { *duty_us } else { *period_us - *duty_us };
            if !new_phase && *cycles_remaining != u32::MAX {
                *cycles_remaining -= 1;
            }
            let done = *cycles_remaining == 0 && !new_phase && *cycles_remaining != u32::MAX;
            *phase = new_phase;
            *next_deadline = now_us + dur.max(1) as u64;
            let bit = 1u64 << pos;
            if done {
                lcb.tx = TxState::Idle;
                (new_phase, bit, if new_phase { bit } else { 0 }, None)
            } else {
                (new_phase, bit, if new_phase { bit } else { 0 }, Some(*next_deadline))
            }
        }
        TxState::Servo {
            period_us,
            pulse_us,
            cycles_remaining,
            phase,
            next_deadline,
            ..
        } => {
            let new_phase = !*phase;
            let dur = if new_phase { *pulse_us } else { *period_us - *pulse_us };
            if !new_phase && *cycles_remaining != u32::MAX {
                *cycles_remaining -= 1;
            }
            let done = *cycles_remaining == 0 && !new_phase && *cycles_remaining != u32::MAX;
            *phase = new_phase;
            *next_deadline = now_us + dur.max(1) as u64;
            let bit = 1u64 << pos;
            if done {
                lcb.tx = TxState::Idle;
                (new_phase, bit, if new_phase { bit } else { 0 }, None)
            } else {
                (new_phase, bit, if new_phase { bit } else { 0 }, Some(*next_deadline))
            }
        }
        TxState::Wave { program, pc, next_deadline } => {
            if *pc >= program.len() {
                lcb.tx = TxState::Idle;
                return;
            }
            let step = program[*pc];
            *pc += 1;
            if *pc >= program.len() {
                lcb.tx = TxState::Idle;
                (lcb.level, step.mask, step.bits, None)
            } else {
                *next_deadline = now_us + step.delay_us as u64;
                (lcb.level, step.mask, step.bits, Some(*next_deadline))
            }
        }
    };
    lcb.level = new_level;
    let _ = next;
    if let Err(e) = chip.guard(|| group.raw.set_values(step_mask, step_bits)) {
        tracing::warn!(line, error = %e, "transmission write failed");
    }
}

fn validate_cycles(cycles: u32) -> u32 {
    if cycles == 0 {
        u32::MAX
    } else {
        cycles
    }
}

/// `tx_pulse(line, on_us, off_us, offset_us, cycles)` — §4.2.
pub fn tx_pulse(
    chip: &Chip,
    line: u32,
    on_us: u32,
    off_us: u32,
    offset_us: u32,
    cycles: u32,
) -> Result<()> {
    chip.check_faulted()?;
    let mut state = chip.state.lock().unwrap();
    let (first, pos) = locate(&state, line)?;
    let lcb = &mut state.groups.get_mut(&first).unwrap().lcbs[pos];
    let now = now_ns() / 1000;
    lcb.tx = TxState::Pulse {
        on_us,
        off_us,
        offset_us,
        cycles_remaining: validate_cycles(cycles),
        phase: false,
        next_deadline: now + offset_us as u64,
    };
    drop(state);
    chip.wake.notify_all();
    Ok(())
}

/// `tx_pwm(line, freq_hz, duty_pct, offset_us, cycles)` — §4.2.
pub fn tx_pwm(
    chip: &Chip,
    line: u32,
    freq_hz: u32,
    duty_pct: u32,
    offset_us: u32,
    cycles: u32,
) -> Result<()> {
    chip.check_faulted()?;
    if !(MIN_PWM_FREQ_HZ..=MAX_PWM_FREQ_HZ).contains(&freq_hz) {
        return Err(Error::new(ErrorKind::BadPwmFreq, format!("{freq_hz}Hz out of range")));
    }
    if duty_pct > 100 {
        return Err(Error::new(ErrorKind::BadPwmDuty, format!("{duty_pct}% out of range")));
    }
    let mut state = chip.state.lock().unwrap();
    let (first, pos) = locate(&state, line)?;
    let period_us = 1_000_000 / freq_hz;
    let duty_us = period_us * duty_pct / 100;
    let lcb = &mut state.groups.get_mut(&first).unwrap().lcbs[pos];
    if duty_pct == 0 || duty_pct == 100 {
        lcb.tx = TxState::Idle;
        let level = duty_pct == 100;
        lcb.level = level;
        let group = state.groups.get(&first).unwrap();
        let bit = 1u64 << pos;
        chip.guard(|| group.raw.set_values(bit, if level { bit } else { 0 }))?;
        drop(state);
        chip.wake.notify_all();
        return Ok(());
    }
    let now = now_ns() / 1000;
    lcb.tx = TxState::Pwm {
        period_us,
        duty_us,
        offset_us,
        cycles_remaining: validate_cycles(cycles),
        phase: false,
        next_deadline: now + offset_us as u64,
    };
    drop(state);
    chip.wake.notify_all();
    Ok(())
}

/// `tx_servo(line, pulse_us, freq_hz, offset_us, cycles)` — §4.2.
pub fn tx_servo(
    chip: &Chip,
    line: u32,
    pulse_us: u32,
    freq_hz: u32,
    offset_us: u32,
    cycles: u32,
) -> Result<()> {
    chip.check_faulted()?;
    if !(MIN_SERVO_PULSE_US..=MAX_SERVO_PULSE_US).contains(&pulse_us) {
        return Err(Error::new(ErrorKind::BadServoWidth, format!("{pulse_us}us out of range")));
    }
    if !(MIN_SERVO_FREQ_HZ..=MAX_SERVO_FREQ_HZ).contains(&freq_hz) {
        return Err(Error::new(ErrorKind::BadServoFreq, format!("{freq_hz}Hz out of range")));
    }
    let mut state = chip.state.lock().unwrap();
    let (first, pos) = locate(&state, line)?;
    let period_us = 1_000_000 / freq_hz;
    let now = now_ns() / 1000;
    let lcb = &mut state.groups.get_mut(&first).unwrap().lcbs[pos];
    lcb.tx = TxState::Servo {
        period_us,
        pulse_us,
        offset_us,
        cycles_remaining: validate_cycles(cycles),
        phase: false,
        next_deadline: now + offset_us as u64,
    };
    drop(state);
    chip.wake.notify_all();
    Ok(())
}

/// `tx_wave(line_of_group, steps[])` — §4.2. Executes `steps` once.
pub fn tx_wave(chip: &Chip, line_of_group: u32, steps: Vec<WaveStep>) -> Result<()> {
    chip.check_faulted()?;
    let mut state = chip.state.lock().unwrap();
    let (first, pos) = locate(&state, line_of_group)?;
    if steps.is_empty() {
        state.groups.get_mut(&first).unwrap().lcbs[pos].tx = TxState::Idle;
        return Ok(());
    }
    let now = now_ns() / 1000;
    let first_delay = steps[0].delay_us as u64;
    state.groups.get_mut(&first).unwrap().lcbs[pos].tx = TxState::Wave {
        program: steps,
        pc: 0,
        next_deadline: now + first_delay,
    };
    drop(state);
    chip.wake.notify_all();
    Ok(())
}

pub fn tx_busy(chip: &Chip, line: u32, kind: Option<TxKind>) -> Result<bool> {
    let state = chip.state.lock().unwrap();
    let (first, pos) = locate(&state, line)?;
    Ok(state.groups[&first].lcbs[pos].tx.is_busy(kind))
}

pub fn tx_room(chip: &Chip, line: u32, kind: Option<TxKind>) -> Result<u32> {
    let busy = tx_busy(chip, line, kind)?;
    Ok(if busy { 0 } else { TX_ROOM_CAPACITY })
}

fn locate(state: &crate::chip::ChipState, line: u32) -> Result<(u32, usize)> {
    state
        .groups
        .iter()
        .find_map(|(&first, g)| g.offsets.iter().position(|&o| o == line).map(|p| (first, p)))
        .ok_or_else(|| Error::new(ErrorKind::BadGpio, "line is not claimed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::mock::mock_chip;
    use crate::lcb::LineFlags;
    use std::time::Duration;

    #[test]
    fn pwm_full_duty_pins_high_without_scheduling() {
        let chip = mock_chip(0, 32);
        chip.claim_output(LineFlags::empty(), 5, false).unwrap();
        tx_pwm(&chip, 5, 1000, 100, 0, 0).unwrap();
        assert!(!tx_busy(&chip, 5, None).unwrap());
        let state = chip.state.lock().unwrap();
        assert_eq!(state.groups[&5].raw.get_values().unwrap() & 1, 1);
    }

    #[test]
    fn pwm_zero_duty_pins_low_without_scheduling() {
        let chip = mock_chip(0, 32);
        chip.claim_output(LineFlags::empty(), 5, true).unwrap();
        tx_pwm(&chip, 5, 1000, 0, 0, 0).unwrap();
        assert!(!tx_busy(&chip, 5, None).unwrap());
        let state = chip.state.lock().unwrap();
        assert_eq!(state.groups[&5].raw.get_values().unwrap() & 1, 0);
    }

    #[test]
    fn empty_wave_completes_immediately() {
        let chip = mock_chip(0, 32);
        chip.claim_output(LineFlags::empty(), 5, false).unwrap();
        tx_wave(&chip, 5, vec![]).unwrap();
        assert!(!tx_busy(&chip, 5, None).unwrap());
    }

    #[test]
    fn pulse_with_one_cycle_completes_after_two_edges() {
        let chip = mock_chip(0, 32);
        chip.claim_output(LineFlags::empty(), 5, false).unwrap();
        tx_pulse(&chip, 5, 1000, 1000, 0, 1).unwrap();
        assert!(tx_busy(&chip, 5, None).unwrap());
        let handle = spawn(chip.clone());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!tx_busy(&chip, 5, None).unwrap());
        drop(chip);
        let _ = handle;
    }
}
