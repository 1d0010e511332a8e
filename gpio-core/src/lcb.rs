//! Per-line state: the `LineControlBlock` (LCB) and the transmission
//! state machine it carries.

use std::time::Duration;

use bitflags::bitflags;

bitflags! {
    /// Group-level line flags, validated against the kernel's own
    /// mutually-exclusive-bit rules before being accepted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LineFlags: u32 {
        const ACTIVE_LOW  = 1 << 0;
        const OPEN_DRAIN  = 1 << 1;
        const OPEN_SOURCE = 1 << 2;
        const PULL_UP     = 1 << 3;
        const PULL_DOWN   = 1 << 4;
        const BIAS_DISABLE = 1 << 5;
    }
}

impl LineFlags {
    /// Flag combinations the kernel (and this engine) rejects outright.
    pub fn validate(self) -> Result<(), &'static str> {
        if self.contains(LineFlags::OPEN_DRAIN) && self.contains(LineFlags::OPEN_SOURCE) {
            return Err("open-drain and open-source are mutually exclusive");
        }
        let pulls = [LineFlags::PULL_UP, LineFlags::PULL_DOWN, LineFlags::BIAS_DISABLE]
            .into_iter()
            .filter(|f| self.contains(*f))
            .count();
        if pulls > 1 {
            return Err("at most one bias setting may be selected");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeMode {
    None,
    Rising,
    Falling,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    Input,
    Output,
    Alert,
}

/// One step of a `Wave` program: `(bits, mask, delay_us)` applied
/// atomically across the owning group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveStep {
    pub bits: u64,
    pub mask: u64,
    pub delay_us: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Pulse,
    Pwm,
    Servo,
    Wave,
}

/// The running state of a line's software-timed waveform generator.
#[derive(Debug, Clone)]
pub enum TxState {
    Idle,
    Pulse {
        on_us: u32,
        off_us: u32,
        offset_us: u32,
        cycles_remaining: u32,
        phase: bool,
        next_deadline: u64,
    },
    Pwm {
        period_us: u32,
        duty_us: u32,
        offset_us: u32,
        cycles_remaining: u32,
        phase: bool,
        next_deadline: u64,
    },
    Servo {
        period_us: u32,
        pulse_us: u32,
        offset_us: u32,
        cycles_remaining: u32,
        phase: bool,
        next_deadline: u64,
    },
    Wave {
        program: Vec<WaveStep>,
        pc: usize,
        next_deadline: u64,
    },
}

impl TxState {
    pub fn kind(&self) -> Option<TxKind> {
        match self {
            TxState::Idle => None,
            TxState::Pulse { .. } => Some(TxKind::Pulse),
            TxState::Pwm { .. } => Some(TxKind::Pwm),
            TxState::Servo { .. } => Some(TxKind::Servo),
            TxState::Wave { .. } => Some(TxKind::Wave),
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        match self {
            TxState::Idle => None,
            TxState::Pulse { next_deadline, .. }
            | TxState::Pwm { next_deadline, .. }
            | TxState::Servo { next_deadline, .. }
            | TxState::Wave { next_deadline, .. } => Some(*next_deadline),
        }
    }

    pub fn is_busy(&self, kind: Option<TxKind>) -> bool {
        match kind {
            None => !matches!(self, TxState::Idle),
            Some(k) => self.kind() == Some(k),
        }
    }
}

/// Upper bound on how many independent deadline-scheduled steps a
/// single LCB may have queued; §4.2 calls this "implementation-defined
/// ≥ 16 steps". Since each LCB advances one step at a time, room is
/// always `TX_ROOM_CAPACITY` minus zero (no queueing beyond the current
/// step) while busy, and the full capacity while idle.
pub const TX_ROOM_CAPACITY: u32 = 16;

pub const MAX_DEBOUNCE_US: u64 = 5_000_000;
pub const MAX_WATCHDOG_US: u64 = 300_000_000;

/// Per-line state record, held inside a `LineGroup` at a fixed offset.
#[derive(Debug, Clone)]
pub struct LineControlBlock {
    pub level: bool,
    pub debounce_us: u64,
    pub watchdog_us: u64,
    pub edge_mode: EdgeMode,
    pub tx: TxState,
    pub last_edge_ts: u64,
    pub last_report_ts: u64,
}

impl LineControlBlock {
    pub fn new(initial_level: bool) -> Self {
        Self {
            level: initial_level,
            debounce_us: 0,
            watchdog_us: 0,
            edge_mode: EdgeMode::None,
            tx: TxState::Idle,
            last_edge_ts: 0,
            last_report_ts: 0,
        }
    }

    pub fn set_debounce(&mut self, us: u64) -> Result<(), crate::error::Error> {
        if us > MAX_DEBOUNCE_US {
            return Err(crate::error::Error::new(
                crate::error::ErrorKind::BadDebounceMics,
                format!("debounce {us}us exceeds {MAX_DEBOUNCE_US}us"),
            ));
        }
        self.debounce_us = us;
        Ok(())
    }

    pub fn set_watchdog(&mut self, us: u64) -> Result<(), crate::error::Error> {
        if us > MAX_WATCHDOG_US {
            return Err(crate::error::Error::new(
                crate::error::ErrorKind::BadWatchdogMics,
                format!("watchdog {us}us exceeds {MAX_WATCHDOG_US}us"),
            ));
        }
        self.watchdog_us = us;
        Ok(())
    }

    /// Cancel any running transmission, as happens implicitly on
    /// `free` or a mode change (§4.2).
    pub fn cancel_tx(&mut self) {
        self.tx = TxState::Idle;
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_micros(self.debounce_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_flags_are_rejected() {
        let f = LineFlags::OPEN_DRAIN | LineFlags::OPEN_SOURCE;
        assert!(f.validate().is_err());
    }

    #[test]
    fn single_bias_is_accepted() {
        let f = LineFlags::PULL_UP;
        assert!(f.validate().is_ok());
    }

    #[test]
    fn debounce_over_limit_is_rejected() {
        let mut lcb = LineControlBlock::new(false);
        assert!(lcb.set_debounce(MAX_DEBOUNCE_US + 1).is_err());
        assert!(lcb.set_debounce(MAX_DEBOUNCE_US).is_ok());
    }

    #[test]
    fn watchdog_over_limit_is_rejected() {
        let mut lcb = LineControlBlock::new(false);
        assert!(lcb.set_watchdog(MAX_WATCHDOG_US + 1).is_err());
        assert!(lcb.set_watchdog(MAX_WATCHDOG_US).is_ok());
    }

    #[test]
    fn cancel_resets_to_idle() {
        let mut lcb = LineControlBlock::new(false);
        lcb.tx = TxState::Pulse {
            on_us: 1,
            off_us: 1,
            offset_us: 0,
            cycles_remaining: 1,
            phase: false,
            next_deadline: 0,
        };
        lcb.cancel_tx();
        assert!(matches!(lcb.tx, TxState::Idle));
    }
}
