//! The `Report` record produced by the edge sampler and fanned out by
//! the dispatcher (§3, §4.3).

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReportFlags: u8 {
        const EDGE     = 1 << 0;
        const WATCHDOG = 1 << 1;
        const SCRIPT   = 1 << 2;
        /// Set on the synthetic record a notifier inserts in place of
        /// reports it had to drop under backpressure (§4.3, open question).
        const OVERFLOW = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub timestamp_ns: u64,
    pub chip: u16,
    pub line: u16,
    pub level: u8,
    pub flags: ReportFlags,
}

impl Report {
    pub fn edge(chip: u16, line: u16, level: bool, timestamp_ns: u64) -> Self {
        Self {
            timestamp_ns,
            chip,
            line,
            level: level as u8,
            flags: ReportFlags::EDGE,
        }
    }

    pub fn watchdog(chip: u16, line: u16, timestamp_ns: u64) -> Self {
        Self {
            timestamp_ns,
            chip,
            line,
            level: 0,
            flags: ReportFlags::WATCHDOG,
        }
    }

    pub fn overflow_marker(chip: u16, line: u16, timestamp_ns: u64) -> Self {
        Self {
            timestamp_ns,
            chip,
            line,
            level: 0,
            flags: ReportFlags::OVERFLOW,
        }
    }
}
