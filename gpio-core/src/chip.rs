//! Per-chip state: the claimed `LineGroup`s, their `LineControlBlock`s,
//! and the single mutex (+ wake condvar) that the transmission and
//! sampler threads of `tx.rs` / `sampler.rs` coordinate through.

use std::{
    collections::BTreeMap,
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
};

use gpio_uapi::v2::{self, LineFlag as KernelLineFlag, LineRequestBuilder};

use crate::{
    error::{Error, ErrorKind, Result},
    lcb::{EdgeMode, GroupMode, LineControlBlock, LineFlags},
};

/// Abstraction over a group of lines requested together, so the
/// transmission engine and sampler can drive either a real kernel
/// line-request fd or, in tests, an in-memory stand-in.
pub trait RawLineGroup: Send + Sync {
    fn get_values(&self) -> Result<u64>;
    fn set_values(&self, mask: u64, bits: u64) -> Result<()>;
    fn num_lines(&self) -> u32;
    /// Blocking read of the next batch of kernel edge events, if any
    /// are ready; a mock backend may return an empty vec forever.
    fn poll_events(&self) -> Result<Vec<RawEdgeEvent>>;
}

#[derive(Debug, Clone, Copy)]
pub struct RawEdgeEvent {
    pub offset: u32,
    pub rising: bool,
    pub timestamp_ns: u64,
}

/// Abstraction over chip-level operations (open, chip-info, line-info,
/// line-request) so `Chip` can be backed by the real character device
/// or, in tests, a `MockBackend`.
pub trait ChipBackend: Send + Sync {
    fn chip_info(&self) -> Result<(String, String, u32)>;
    fn line_info(&self, offset: u32) -> Result<LineInfoSnapshot>;
    fn request_lines(
        &self,
        offsets: &[u32],
        flags: LineFlags,
        mode: GroupMode,
        initial_bits: u64,
        debounce_us: u64,
    ) -> Result<Box<dyn RawLineGroup>>;
}

#[derive(Debug, Clone)]
pub struct LineInfoSnapshot {
    pub name: String,
    pub consumer: String,
    pub in_use: bool,
}

/// `ChipBackend` implementation over the real `/dev/gpiochipN` character
/// device, via `gpio-uapi`.
pub struct KernelBackend {
    fd: std::fs::File,
}

impl KernelBackend {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let fd = std::fs::File::open(path.as_ref()).map_err(|e| {
            Error::with_source(ErrorKind::CannotOpenChip, "opening gpiochip device", e)
        })?;
        Ok(Self { fd })
    }
}

impl ChipBackend for KernelBackend {
    fn chip_info(&self) -> Result<(String, String, u32)> {
        let info = gpio_uapi::common::get_chipinfo(self.fd.as_raw_fd())?;
        Ok((
            info.name().into_owned(),
            info.label().into_owned(),
            info.lines(),
        ))
    }

    fn line_info(&self, offset: u32) -> Result<LineInfoSnapshot> {
        let info = v2::get_lineinfo(self.fd.as_raw_fd(), offset)?;
        Ok(LineInfoSnapshot {
            name: info.name().into_owned(),
            consumer: info.consumer().into_owned(),
            in_use: info.flags().contains(KernelLineFlag::USED),
        })
    }

    fn request_lines(
        &self,
        offsets: &[u32],
        flags: LineFlags,
        mode: GroupMode,
        initial_bits: u64,
        debounce_us: u64,
    ) -> Result<Box<dyn RawLineGroup>> {
        let kflags = to_kernel_flags(flags, mode);
        let mask: u64 = if offsets.len() >= 64 {
            u64::MAX
        } else {
            (1u64 << offsets.len()) - 1
        };
        let mut builder = LineRequestBuilder::new(offsets, kflags, "gpiod");
        if mode == GroupMode::Output {
            builder = builder.set_output_values(mask as libc::c_ulong, initial_bits as libc::c_ulong);
        }
        if debounce_us > 0 {
            builder = builder.set_debounce(mask as libc::c_ulong, debounce_us as u32);
        }
        let mut request = builder.build()?;
        let handle = v2::get_line(self.fd.as_raw_fd(), &mut request)?;
        Ok(Box::new(KernelLineGroup { handle }))
    }
}

fn to_kernel_flags(flags: LineFlags, mode: GroupMode) -> KernelLineFlag {
    let mut k = KernelLineFlag::empty();
    if flags.contains(LineFlags::ACTIVE_LOW) {
        k |= KernelLineFlag::ACTIVE_LOW;
    }
    if flags.contains(LineFlags::OPEN_DRAIN) {
        k |= KernelLineFlag::OPEN_DRAIN;
    }
    if flags.contains(LineFlags::OPEN_SOURCE) {
        k |= KernelLineFlag::OPEN_SOURCE;
    }
    if flags.contains(LineFlags::PULL_UP) {
        k |= KernelLineFlag::BIAS_PULL_UP;
    }
    if flags.contains(LineFlags::PULL_DOWN) {
        k |= KernelLineFlag::BIAS_PULL_DOWN;
    }
    if flags.contains(LineFlags::BIAS_DISABLE) {
        k |= KernelLineFlag::BIAS_DISABLED;
    }
    k |= match mode {
        GroupMode::Input => KernelLineFlag::INPUT,
        GroupMode::Output => KernelLineFlag::OUTPUT,
        GroupMode::Alert => KernelLineFlag::INPUT | KernelLineFlag::EDGE_RISING | KernelLineFlag::EDGE_FALLING,
    };
    k
}

struct KernelLineGroup {
    handle: v2::LineHandle,
}

impl RawLineGroup for KernelLineGroup {
    fn get_values(&self) -> Result<u64> {
        Ok(self.handle.get_values()? as u64)
    }

    fn set_values(&self, mask: u64, bits: u64) -> Result<()> {
        self.handle.set_values_masked(mask as libc::c_ulong, bits as libc::c_ulong)?;
        Ok(())
    }

    fn num_lines(&self) -> u32 {
        self.handle.num_lines()
    }

    fn poll_events(&self) -> Result<Vec<RawEdgeEvent>> {
        let mut buf = [v2::LineEvent::default(); 16];
        let events = self.handle.read_events(&mut buf)?;
        Ok(events
            .iter()
            .map(|e| RawEdgeEvent {
                offset: e.offset(),
                rising: e.is_rising(),
                timestamp_ns: e.timestamp_ns(),
            })
            .collect())
    }
}

/// A kernel-granted set of line offsets claimed in one call (§3).
pub struct LineGroup {
    pub offsets: Vec<u32>,
    pub mode: GroupMode,
    pub flags: LineFlags,
    pub raw: Box<dyn RawLineGroup>,
    pub lcbs: Vec<LineControlBlock>,
    /// The chip's `user` at the moment this group was claimed. Fixed
    /// for the group's lifetime even if `set_user` is called again
    /// afterward, so `get_line_info` always reports who actually
    /// claimed a line rather than whoever is currently active.
    pub claimed_by: String,
}

impl LineGroup {
    fn position_of(&self, offset: u32) -> Option<usize> {
        self.offsets.iter().position(|&o| o == offset)
    }
}

#[derive(Default)]
pub struct ChipState {
    pub groups: BTreeMap<u32, LineGroup>,
    pub user: String,
}

impl ChipState {
    fn find(&self, offset: u32) -> Option<(u32, usize)> {
        self.groups
            .iter()
            .find_map(|(&first, g)| g.position_of(offset).map(|pos| (first, pos)))
    }
}

/// Owns one gpiochip's kernel fd, its claimed line groups, and the lock
/// that the transmission/sampler threads for this chip serialise on.
pub struct Chip {
    pub index: u32,
    pub name: String,
    pub backend: Box<dyn ChipBackend>,
    pub state: Mutex<ChipState>,
    /// Signalled whenever a `tx_*` call or `free` moves an LCB's
    /// earliest deadline sooner than the engine thread is currently
    /// sleeping for.
    pub wake: Condvar,
    /// Set by `Engine::close_chip` before the chip is dropped from the
    /// registry. The transmission and sampler threads check this flag
    /// on every loop iteration instead of inferring teardown from
    /// `Arc::strong_count`, which never falls to 1 while both threads
    /// hold their own clone (§5).
    pub shutdown: AtomicBool,
    /// Set once a device-loss error (`ENODEV`/`ENXIO`/`EBADF`) surfaces
    /// from this chip's backend; sticky until the chip is closed, so
    /// every later operation fails with `DeviceFaulted` too (§7).
    faulted: AtomicBool,
}

impl Chip {
    pub fn open(index: u32, backend: Box<dyn ChipBackend>) -> Result<Arc<Chip>> {
        let (name, _label, _lines) = backend.chip_info()?;
        Ok(Arc::new(Chip {
            index,
            name,
            backend,
            state: Mutex::new(ChipState::default()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
        }))
    }

    /// Signals the transmission and sampler threads for this chip to
    /// stop and wakes anything currently sleeping on `wake`.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    pub(crate) fn check_faulted(&self) -> Result<()> {
        if self.is_faulted() {
            return Err(Error::new(ErrorKind::DeviceFaulted, "chip is faulted"));
        }
        Ok(())
    }

    /// Runs `f`, marking the chip permanently faulted if it fails with
    /// `DeviceFaulted`, and returns its result unchanged.
    pub(crate) fn guard<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let result = f();
        if let Err(e) = &result {
            if e.kind == ErrorKind::DeviceFaulted {
                self.faulted.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    pub fn get_chip_info(&self) -> Result<(String, String, u32)> {
        self.check_faulted()?;
        self.guard(|| self.backend.chip_info())
    }

    pub fn get_line_info(&self, offset: u32) -> Result<LineInfoSnapshot> {
        self.check_faulted()?;
        let mut info = self.guard(|| self.backend.line_info(offset))?;
        let state = self.state.lock().unwrap();
        if let Some((first, _)) = state.find(offset) {
            info.consumer = state.groups[&first].claimed_by.clone();
            info.in_use = true;
        }
        Ok(info)
    }

    pub fn set_user(&self, user: impl Into<String>) {
        self.state.lock().unwrap().user = user.into();
    }

    fn claim(
        &self,
        offsets: &[u32],
        flags: LineFlags,
        mode: GroupMode,
        initial_bits: u64,
        debounce_us: u64,
    ) -> Result<u32> {
        self.check_faulted()?;
        flags
            .validate()
            .map_err(|m| Error::new(ErrorKind::BadFlags, m))?;
        let mut state = self.state.lock().unwrap();
        for &offset in offsets {
            if state.find(offset).is_some() {
                return Err(Error::new(
                    ErrorKind::GpioInUse,
                    format!("line {offset} already claimed"),
                ));
            }
        }
        let raw = self.guard(|| {
            self.backend
                .request_lines(offsets, flags, mode, initial_bits, debounce_us)
        })?;
        let mut lcbs = Vec::with_capacity(offsets.len());
        for (i, _) in offsets.iter().enumerate() {
            let bit_set = initial_bits & (1 << i) != 0;
            let mut lcb = LineControlBlock::new(bit_set);
            if mode == GroupMode::Alert {
                lcb.edge_mode = EdgeMode::Both;
                if debounce_us > 0 {
                    lcb.set_debounce(debounce_us)?;
                }
            }
            lcbs.push(lcb);
        }
        let first = offsets[0];
        let claimed_by = state.user.clone();
        state.groups.insert(
            first,
            LineGroup {
                offsets: offsets.to_vec(),
                mode,
                flags,
                raw,
                lcbs,
                claimed_by,
            },
        );
        Ok(first)
    }

    pub fn claim_input(&self, flags: LineFlags, line: u32) -> Result<u32> {
        self.claim(&[line], flags, GroupMode::Input, 0, 0)
    }

    pub fn claim_output(&self, flags: LineFlags, line: u32, initial_level: bool) -> Result<u32> {
        let bits = if initial_level { 1 } else { 0 };
        self.claim(&[line], flags, GroupMode::Output, bits, 0)
    }

    pub fn claim_alert(
        &self,
        flags: LineFlags,
        line: u32,
        debounce_us: u64,
    ) -> Result<u32> {
        self.claim(&[line], flags, GroupMode::Alert, 0, debounce_us)
    }

    pub fn group_claim_input(&self, flags: LineFlags, lines: &[u32]) -> Result<u32> {
        self.claim(lines, flags, GroupMode::Input, 0, 0)
    }

    pub fn group_claim_output(
        &self,
        flags: LineFlags,
        lines: &[u32],
        initial_levels: &[bool],
    ) -> Result<u32> {
        if lines.len() != initial_levels.len() {
            return Err(Error::new(
                ErrorKind::BadFlags,
                "lines and initial_levels must match in length",
            ));
        }
        let mut bits = 0u64;
        for (i, &lvl) in initial_levels.iter().enumerate() {
            if lvl {
                bits |= 1 << i;
            }
        }
        self.claim(lines, flags, GroupMode::Output, bits, 0)
    }

    /// Frees the whole group containing `any_line_in_group`, cancelling
    /// any running transmissions on its lines (§4.1, §4.2).
    pub fn free(&self, any_line_in_group: u32) -> Result<()> {
        self.check_faulted()?;
        let mut state = self.state.lock().unwrap();
        let (first, _) = state
            .find(any_line_in_group)
            .ok_or_else(|| Error::new(ErrorKind::BadGpio, "line is not claimed"))?;
        state.groups.remove(&first);
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    pub fn set_debounce(&self, line: u32, us: u64) -> Result<()> {
        self.check_faulted()?;
        let mut state = self.state.lock().unwrap();
        let (first, pos) = state
            .find(line)
            .ok_or_else(|| Error::new(ErrorKind::BadGpio, "line is not claimed"))?;
        state.groups.get_mut(&first).unwrap().lcbs[pos].set_debounce(us)
    }

    pub fn set_watchdog(&self, line: u32, us: u64) -> Result<()> {
        self.check_faulted()?;
        let mut state = self.state.lock().unwrap();
        let (first, pos) = state
            .find(line)
            .ok_or_else(|| Error::new(ErrorKind::BadGpio, "line is not claimed"))?;
        state.groups.get_mut(&first).unwrap().lcbs[pos].set_watchdog(us)
    }

    /// Immediate, un-scheduled level write, bypassing the transmission
    /// engine. Used by `free`-adjacent direct writes and script `gw`.
    pub fn write_level(&self, line: u32, level: bool) -> Result<()> {
        self.check_faulted()?;
        let mut state = self.state.lock().unwrap();
        let (first, pos) = state
            .find(line)
            .ok_or_else(|| Error::new(ErrorKind::BadGpio, "line is not claimed"))?;
        let group = state.groups.get_mut(&first).unwrap();
        let bit = 1u64 << pos;
        self.guard(|| group.raw.set_values(bit, if level { bit } else { 0 }))?;
        group.lcbs[pos].level = level;
        Ok(())
    }

    pub fn read_level(&self, line: u32) -> Result<bool> {
        self.check_faulted()?;
        let state = self.state.lock().unwrap();
        let (first, pos) = state
            .find(line)
            .ok_or_else(|| Error::new(ErrorKind::BadGpio, "line is not claimed"))?;
        let group = &state.groups[&first];
        let bits = self.guard(|| group.raw.get_values())?;
        Ok(bits & (1 << pos) != 0)
    }

    pub fn get_mode(&self, line: u32) -> Result<GroupMode> {
        self.check_faulted()?;
        let state = self.state.lock().unwrap();
        let (first, _) = state
            .find(line)
            .ok_or_else(|| Error::new(ErrorKind::BadGpio, "line is not claimed"))?;
        Ok(state.groups[&first].mode)
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    pub struct MockBackend {
        pub name: String,
        pub lines: u32,
    }

    impl ChipBackend for MockBackend {
        fn chip_info(&self) -> Result<(String, String, u32)> {
            Ok((self.name.clone(), "mock".into(), self.lines))
        }

        fn line_info(&self, offset: u32) -> Result<LineInfoSnapshot> {
            Ok(LineInfoSnapshot {
                name: format!("line{offset}"),
                consumer: String::new(),
                in_use: false,
            })
        }

        fn request_lines(
            &self,
            offsets: &[u32],
            _flags: LineFlags,
            _mode: GroupMode,
            initial_bits: u64,
            _debounce_us: u64,
        ) -> Result<Box<dyn RawLineGroup>> {
            Ok(Box::new(MockLineGroup {
                bits: AtomicU64::new(initial_bits),
                num_lines: offsets.len() as u32,
            }))
        }
    }

    pub struct MockLineGroup {
        pub bits: AtomicU64,
        pub num_lines: u32,
    }

    impl RawLineGroup for MockLineGroup {
        fn get_values(&self) -> Result<u64> {
            Ok(self.bits.load(Ordering::SeqCst))
        }

        fn set_values(&self, mask: u64, bits: u64) -> Result<()> {
            self.bits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                    Some((cur & !mask) | (bits & mask))
                })
                .unwrap();
            Ok(())
        }

        fn num_lines(&self) -> u32 {
            self.num_lines
        }

        fn poll_events(&self) -> Result<Vec<RawEdgeEvent>> {
            Ok(Vec::new())
        }
    }

    pub fn mock_chip(index: u32, lines: u32) -> Arc<Chip> {
        Chip::open(
            index,
            Box::new(MockBackend {
                name: format!("mockchip{index}"),
                lines,
            }),
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::mock_chip;
    use super::*;

    #[test]
    fn claim_output_then_read_returns_initial_value() {
        let chip = mock_chip(0, 32);
        chip.claim_output(LineFlags::empty(), 5, true).unwrap();
        let state = chip.state.lock().unwrap();
        let group = &state.groups[&5];
        assert_eq!(group.raw.get_values().unwrap() & 1, 1);
    }

    #[test]
    fn double_claim_fails_in_use() {
        let chip = mock_chip(0, 32);
        chip.claim_input(LineFlags::empty(), 5).unwrap();
        let err = chip.claim_input(LineFlags::empty(), 5).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GpioInUse);
    }

    #[test]
    fn free_removes_group() {
        let chip = mock_chip(0, 32);
        chip.claim_input(LineFlags::empty(), 5).unwrap();
        chip.free(5).unwrap();
        assert!(chip.state.lock().unwrap().groups.is_empty());
    }

    #[test]
    fn group_claim_is_atomic_on_conflict() {
        let chip = mock_chip(0, 32);
        chip.claim_input(LineFlags::empty(), 10).unwrap();
        let err = chip
            .group_claim_input(LineFlags::empty(), &[9, 10, 11])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::GpioInUse);
        assert!(chip.state.lock().unwrap().find(9).is_none());
        assert!(chip.state.lock().unwrap().find(11).is_none());
    }
}
