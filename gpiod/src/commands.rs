//! Command dispatch: maps wire request headers onto `gpio_core::Engine`
//! operations (§4.4).

use gpio_core::{
    bus::file::FileMode,
    handle::Handle,
    lcb::{LineFlags, TxKind, WaveStep},
    notifier::Sink,
    ErrorKind,
};

use crate::{permit::PermitSet, protocol::RequestHeader, session::Session};

/// Stable numeric command table (§4.4). Grouped by the resource family
/// they act on; values are deliberately spread out in blocks of 16 so
/// related commands stay visually grouped without implying more
/// structure than a flat enum has.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Cmd {
    OpenChip = 0,
    CloseChip = 1,
    ClaimInput = 2,
    ClaimOutput = 3,
    ClaimAlert = 4,
    Free = 5,
    SetDebounce = 6,
    SetWatchdog = 7,
    GetMode = 8,
    GetChipInfo = 9,
    GetLineInfo = 10,
    Read = 11,
    Write = 12,

    TxPulse = 16,
    TxPwm = 17,
    TxServo = 18,
    TxWave = 19,
    TxBusy = 20,
    TxRoom = 21,

    I2cOpen = 32,
    I2cClose = 33,
    I2cReadByte = 34,
    I2cWriteByte = 35,
    SpiOpen = 36,
    SpiClose = 37,
    SerialOpen = 38,
    SerialClose = 39,
    FileOpen = 40,
    FileClose = 41,

    ScriptStore = 48,
    ScriptRun = 49,
    ScriptStop = 50,
    ScriptStatus = 51,
    ScriptUpdate = 52,
    ScriptDelete = 53,

    NotifyOpen = 56,
    NotifyClose = 57,
    NotifyPause = 58,
    NotifyResume = 59,
    NotifySubscribe = 60,

    SetUser = 64,
    SetShareId = 65,
    UseShareId = 66,
    GetSbcName = 67,
    RgpioVersion = 68,

    ShellExec = 72,
}

impl Cmd {
    pub fn from_u16(v: u16) -> Option<Self> {
        use Cmd::*;
        Some(match v {
            0 => OpenChip, 1 => CloseChip, 2 => ClaimInput, 3 => ClaimOutput, 4 => ClaimAlert,
            5 => Free, 6 => SetDebounce, 7 => SetWatchdog, 8 => GetMode, 9 => GetChipInfo,
            10 => GetLineInfo, 11 => Read, 12 => Write,
            16 => TxPulse, 17 => TxPwm, 18 => TxServo, 19 => TxWave, 20 => TxBusy, 21 => TxRoom,
            32 => I2cOpen, 33 => I2cClose, 34 => I2cReadByte, 35 => I2cWriteByte,
            36 => SpiOpen, 37 => SpiClose, 38 => SerialOpen, 39 => SerialClose,
            40 => FileOpen, 41 => FileClose,
            48 => ScriptStore, 49 => ScriptRun, 50 => ScriptStop, 51 => ScriptStatus,
            52 => ScriptUpdate, 53 => ScriptDelete,
            56 => NotifyOpen, 57 => NotifyClose, 58 => NotifyPause, 59 => NotifyResume,
            60 => NotifySubscribe,
            64 => SetUser, 65 => SetShareId, 66 => UseShareId, 67 => GetSbcName, 68 => RgpioVersion,
            72 => ShellExec,
            _ => return None,
        })
    }

    /// The permit-check bucket this command belongs to, used to index
    /// a user's allowed-command bitmap (§4.4, §9).
    pub fn permit_bit(self) -> u32 {
        self as u32
    }
}

pub struct Dispatched {
    pub status: i32,
    pub payload: Vec<u8>,
}

impl Dispatched {
    fn ok(payload: Vec<u8>) -> Self {
        Self { status: 0, payload }
    }

    fn ok_empty() -> Self {
        Self { status: 0, payload: Vec::new() }
    }

    fn err(kind: ErrorKind) -> Self {
        Self { status: kind.status_code(), payload: Vec::new() }
    }
}

pub fn dispatch(
    session: &mut Session,
    permits: &PermitSet,
    header: &RequestHeader,
    ext: &[u8],
) -> Dispatched {
    let Some(cmd) = Cmd::from_u16(header.cmd) else {
        return Dispatched::err(ErrorKind::BadPointer);
    };
    if !permits.allows(&session.user, cmd.permit_bit()) {
        return Dispatched::err(ErrorKind::NoPermission);
    }
    match run(session, permits, cmd, header, ext) {
        Ok(d) => d,
        Err(e) => {
            tracing::debug!(cmd = ?cmd, error = %e, "command failed");
            Dispatched::err(e.kind)
        }
    }
}

fn run(
    session: &mut Session,
    permits: &PermitSet,
    cmd: Cmd,
    header: &RequestHeader,
    ext: &[u8],
) -> gpio_core::Result<Dispatched> {
    use Cmd::*;
    let engine = session.engine.clone();
    match cmd {
        OpenChip => {
            engine.open_chip(header.p1)?;
            Ok(Dispatched::ok_empty())
        }
        CloseChip => {
            engine.close_chip(header.p1);
            Ok(Dispatched::ok_empty())
        }
        ClaimInput => {
            let flags = LineFlags::from_bits_truncate(header.p2);
            engine.claim_input(session.chip, flags, header.p1)?;
            Ok(Dispatched::ok_empty())
        }
        ClaimOutput => {
            let flags = LineFlags::from_bits_truncate(header.p2);
            let level = ext.first().copied().unwrap_or(0) != 0;
            engine.claim_output(session.chip, flags, header.p1, level)?;
            Ok(Dispatched::ok_empty())
        }
        ClaimAlert => {
            let flags = LineFlags::from_bits_truncate(header.p2);
            let debounce_us = read_u64(ext).unwrap_or(0);
            engine.claim_alert(session.chip, flags, header.p1, debounce_us)?;
            Ok(Dispatched::ok_empty())
        }
        Free => {
            engine.free(session.chip, header.p1)?;
            Ok(Dispatched::ok_empty())
        }
        SetDebounce => {
            engine.chip(session.chip)?.set_debounce(header.p1, header.p2 as u64)?;
            Ok(Dispatched::ok_empty())
        }
        SetWatchdog => {
            engine.chip(session.chip)?.set_watchdog(header.p1, header.p2 as u64)?;
            Ok(Dispatched::ok_empty())
        }
        GetMode => {
            let mode = engine.chip(session.chip)?.get_mode(header.p1)?;
            Ok(Dispatched::ok(vec![mode as u8]))
        }
        GetChipInfo => {
            let (name, label, lines) = engine.chip(session.chip)?.get_chip_info()?;
            let mut payload = lines.to_le_bytes().to_vec();
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(label.as_bytes());
            Ok(Dispatched::ok(payload))
        }
        GetLineInfo => {
            let info = engine.chip(session.chip)?.get_line_info(header.p1)?;
            let mut payload = vec![info.in_use as u8];
            payload.extend_from_slice(info.name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(info.consumer.as_bytes());
            Ok(Dispatched::ok(payload))
        }
        Read => {
            let level = engine.chip(session.chip)?.read_level(header.p1)?;
            Ok(Dispatched::ok(vec![level as u8]))
        }
        Write => {
            let level = header.p2 != 0;
            engine.chip(session.chip)?.write_level(header.p1, level)?;
            Ok(Dispatched::ok_empty())
        }
        TxPulse => {
            let (on_us, off_us, offset_us, cycles) = read_tx_quad(ext)?;
            engine.tx_pulse(session.chip, header.p1, on_us, off_us, offset_us, cycles)?;
            Ok(Dispatched::ok_empty())
        }
        TxPwm => {
            let (freq_hz, duty_pct, offset_us, cycles) = read_tx_quad(ext)?;
            engine.tx_pwm(session.chip, header.p1, freq_hz, duty_pct, offset_us, cycles)?;
            Ok(Dispatched::ok_empty())
        }
        TxServo => {
            let (pulse_us, freq_hz, offset_us, cycles) = read_tx_quad(ext)?;
            engine.tx_servo(session.chip, header.p1, pulse_us, freq_hz, offset_us, cycles)?;
            Ok(Dispatched::ok_empty())
        }
        TxWave => {
            let steps = decode_wave_steps(ext)?;
            engine.tx_wave(session.chip, header.p1, steps)?;
            Ok(Dispatched::ok_empty())
        }
        TxBusy => {
            let kind = decode_tx_kind(header.p2);
            let busy = engine.tx_busy(session.chip, header.p1, kind)?;
            Ok(Dispatched::ok(vec![busy as u8]))
        }
        TxRoom => {
            let kind = decode_tx_kind(header.p2);
            let room = engine.tx_room(session.chip, header.p1, kind)?;
            Ok(Dispatched::ok(room.to_le_bytes().to_vec()))
        }
        I2cOpen => {
            let handle = engine.i2c_open(header.p1, header.p2 as u16, ext.first().map(|&b| b as u32).unwrap_or(0))?;
            session.own(handle);
            Ok(Dispatched::ok(handle.raw().to_le_bytes().to_vec()))
        }
        I2cClose => {
            let handle = decode_handle(header.p1)?;
            engine.i2c_close(handle)?;
            session.disown(handle);
            Ok(Dispatched::ok_empty())
        }
        I2cReadByte => {
            let handle = decode_handle(header.p1)?;
            let byte = engine.with_i2c(handle, |dev| dev.read_byte())?;
            Ok(Dispatched::ok(vec![byte]))
        }
        I2cWriteByte => {
            let handle = decode_handle(header.p1)?;
            let value = header.p2 as u8;
            engine.with_i2c(handle, |dev| dev.write_byte(value))?;
            Ok(Dispatched::ok_empty())
        }
        SpiOpen => {
            let speed = read_u32(ext).unwrap_or(1_000_000);
            let handle = engine.spi_open(header.p1, header.p2, speed, 0)?;
            session.own(handle);
            Ok(Dispatched::ok(handle.raw().to_le_bytes().to_vec()))
        }
        SpiClose => {
            let handle = decode_handle(header.p1)?;
            engine.spi_close(handle)?;
            session.disown(handle);
            Ok(Dispatched::ok_empty())
        }
        SerialOpen => {
            let path = std::str::from_utf8(ext).unwrap_or_default();
            let handle = engine.serial_open(path, header.p1, header.p2)?;
            session.own(handle);
            Ok(Dispatched::ok(handle.raw().to_le_bytes().to_vec()))
        }
        SerialClose => {
            let handle = decode_handle(header.p1)?;
            engine.serial_close(handle)?;
            session.disown(handle);
            Ok(Dispatched::ok_empty())
        }
        FileOpen => {
            let mode = FileMode::from_bits_truncate(header.p2);
            let path = std::str::from_utf8(ext).unwrap_or_default();
            let mut need = crate::permit::FileRw::empty();
            if mode.contains(FileMode::READ) {
                need |= crate::permit::FileRw::READ;
            }
            if mode.contains(FileMode::WRITE) {
                need |= crate::permit::FileRw::WRITE;
            }
            if !permits.allows_path(&session.user, path, need) {
                return Ok(Dispatched::err(ErrorKind::NoPermission));
            }
            let handle = engine.file_open(path, mode)?;
            session.own(handle);
            Ok(Dispatched::ok(handle.raw().to_le_bytes().to_vec()))
        }
        FileClose => {
            let handle = decode_handle(header.p1)?;
            engine.file_close(handle)?;
            session.disown(handle);
            Ok(Dispatched::ok_empty())
        }
        ScriptStore => {
            let source = std::str::from_utf8(ext).unwrap_or_default();
            let id = engine.script_store(session.chip, source)?;
            Ok(Dispatched::ok(id.to_le_bytes().to_vec()))
        }
        ScriptRun => {
            let params = decode_params(ext);
            engine.script_run(session.chip, header.p1, &params)?;
            Ok(Dispatched::ok_empty())
        }
        ScriptStop => {
            engine.script_stop(session.chip, header.p1)?;
            Ok(Dispatched::ok_empty())
        }
        ScriptStatus => {
            let (state, params) = engine.script_status(session.chip, header.p1)?;
            let mut payload = vec![state as u8];
            for p in params {
                payload.extend_from_slice(&p.to_le_bytes());
            }
            Ok(Dispatched::ok(payload))
        }
        ScriptUpdate => {
            let params = decode_params(ext);
            engine.script_update(session.chip, header.p1, &params)?;
            Ok(Dispatched::ok_empty())
        }
        ScriptDelete => {
            engine.script_delete(session.chip, header.p1)?;
            Ok(Dispatched::ok_empty())
        }
        NotifyOpen => {
            let fifo_path = session.notifier_fifo_path();
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(&fifo_path)
                .map_err(|e| gpio_core::Error::with_source(ErrorKind::NoFileAccess, "opening notifier fifo", e))?;
            let handle = engine.notify_open(Sink::Fifo(file));
            session.own(handle);
            Ok(Dispatched::ok(handle.raw().to_le_bytes().to_vec()))
        }
        NotifyClose => {
            let handle = decode_handle(header.p1)?;
            engine.notify_close(handle)?;
            session.disown(handle);
            Ok(Dispatched::ok_empty())
        }
        NotifyPause => {
            engine.notify_pause(decode_handle(header.p1)?)?;
            Ok(Dispatched::ok_empty())
        }
        NotifyResume => {
            engine.notify_resume(decode_handle(header.p1)?)?;
            Ok(Dispatched::ok_empty())
        }
        NotifySubscribe => {
            engine.notify_subscribe(decode_handle(header.p1)?, session.chip as u16, header.p2 as u16)?;
            Ok(Dispatched::ok_empty())
        }
        SetUser => {
            let payload = String::from_utf8_lossy(ext);
            let (user, secret) = payload.split_once('\0').unwrap_or((&payload, ""));
            if !permits.check_secret(user, secret) {
                return Ok(Dispatched::err(ErrorKind::NoPermission));
            }
            session.user = user.to_string();
            Ok(Dispatched::ok_empty())
        }
        SetShareId => {
            session.share_id = Some(gpio_core::handle::ShareId(header.p1));
            Ok(Dispatched::ok_empty())
        }
        UseShareId => {
            session.share_id = Some(gpio_core::handle::ShareId(header.p1));
            Ok(Dispatched::ok_empty())
        }
        GetSbcName => Ok(Dispatched::ok(session.sbc_name.clone().into_bytes())),
        RgpioVersion => Ok(Dispatched::ok(session.protocol_version.to_le_bytes().to_vec())),
        ShellExec => {
            let arg = std::str::from_utf8(ext).unwrap_or_default();
            let status = session.shell_exec(header.p1, arg)?;
            Ok(Dispatched::ok(status.to_le_bytes().to_vec()))
        }
    }
}

fn decode_handle(raw: u32) -> gpio_core::Result<Handle> {
    Handle::from_raw(raw)
}

fn decode_tx_kind(code: u32) -> Option<TxKind> {
    match code {
        1 => Some(TxKind::Pulse),
        2 => Some(TxKind::Pwm),
        3 => Some(TxKind::Servo),
        4 => Some(TxKind::Wave),
        _ => None,
    }
}

fn read_u32(ext: &[u8]) -> Option<u32> {
    ext.get(0..4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

fn read_u64(ext: &[u8]) -> Option<u64> {
    ext.get(0..8).map(|b| u64::from_le_bytes(b.try_into().unwrap()))
}

fn read_tx_quad(ext: &[u8]) -> gpio_core::Result<(u32, u32, u32, u32)> {
    if ext.len() < 16 {
        return Err(gpio_core::Error::new(ErrorKind::BadPointer, "transmission payload too short"));
    }
    let a = u32::from_le_bytes(ext[0..4].try_into().unwrap());
    let b = u32::from_le_bytes(ext[4..8].try_into().unwrap());
    let c = u32::from_le_bytes(ext[8..12].try_into().unwrap());
    let d = u32::from_le_bytes(ext[12..16].try_into().unwrap());
    Ok((a, b, c, d))
}

fn decode_wave_steps(ext: &[u8]) -> gpio_core::Result<Vec<WaveStep>> {
    const STEP_LEN: usize = 20;
    if ext.len() % STEP_LEN != 0 {
        return Err(gpio_core::Error::new(ErrorKind::BadPointer, "malformed wave payload"));
    }
    Ok(ext
        .chunks_exact(STEP_LEN)
        .map(|c| WaveStep {
            bits: u64::from_le_bytes(c[0..8].try_into().unwrap()),
            mask: u64::from_le_bytes(c[8..16].try_into().unwrap()),
            delay_us: u32::from_le_bytes(c[16..20].try_into().unwrap()),
        })
        .collect())
}

fn decode_params(ext: &[u8]) -> Vec<i64> {
    ext.chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}
