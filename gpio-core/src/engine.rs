//! Top-level facade: owns every chip, bus handle, notifier and script,
//! keyed through the process-global handle tables (§2, §5).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use crate::{
    bus::{file::FileHandle, i2c::I2cDevice, serial::SerialDevice, spi::SpiDevice},
    chip::{Chip, KernelBackend},
    dispatcher::Dispatcher,
    error::{Error, ErrorKind, Result},
    handle::{Handle, HandleKind, HandleTable, OwnershipRegistry, ShareId},
    lcb::{LineFlags, TxKind, WaveStep},
    notifier::{Notifier, Sink},
    sampler, script, tx,
};

/// Lock order is fixed: `handle registry -> chip -> notifier set` (§5).
/// `Engine` only ever takes the registry lock (`chips`/`tables`) before
/// delegating into a chip's own lock; it never holds both at once
/// across a blocking call.
pub struct Engine {
    chips: RwLock<HashMap<u32, Arc<Chip>>>,
    chip_threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    scripts: RwLock<HashMap<u32, Arc<script::ScriptEngine>>>,
    i2c: Mutex<HandleTable<I2cDevice>>,
    spi: Mutex<HandleTable<SpiDevice>>,
    serial: Mutex<HandleTable<SerialDevice>>,
    files: Mutex<HandleTable<FileHandle>>,
    notifiers: Mutex<HandleTable<Arc<Notifier>>>,
    pub dispatcher: Arc<Dispatcher>,
    pub ownership: OwnershipRegistry,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            chips: RwLock::new(HashMap::new()),
            chip_threads: Mutex::new(Vec::new()),
            scripts: RwLock::new(HashMap::new()),
            i2c: Mutex::new(HandleTable::new(HandleKind::I2c)),
            spi: Mutex::new(HandleTable::new(HandleKind::Spi)),
            serial: Mutex::new(HandleTable::new(HandleKind::Serial)),
            files: Mutex::new(HandleTable::new(HandleKind::File)),
            notifiers: Mutex::new(HandleTable::new(HandleKind::Notify)),
            dispatcher: Arc::new(Dispatcher::new()),
            ownership: OwnershipRegistry::new(),
        }
    }

    /// Opens `/dev/gpiochip<index>`, starting its transmission and
    /// sampler threads. Idempotent: reopening an already-open chip
    /// returns the existing instance.
    pub fn open_chip(&self, index: u32) -> Result<Arc<Chip>> {
        if let Some(chip) = self.chips.read().unwrap().get(&index) {
            return Ok(chip.clone());
        }
        let backend = KernelBackend::open(format!("/dev/gpiochip{index}"))?;
        let chip = Chip::open(index, Box::new(backend))?;
        self.register_chip(index, chip.clone());
        Ok(chip)
    }

    fn register_chip(&self, index: u32, chip: Arc<Chip>) {
        self.chips.write().unwrap().insert(index, chip.clone());
        self.scripts
            .write()
            .unwrap()
            .insert(index, Arc::new(script::ScriptEngine::new(chip.clone())));
        let mut threads = self.chip_threads.lock().unwrap();
        threads.push(tx::spawn(chip.clone()));
        threads.push(sampler::spawn(chip, self.dispatcher.clone()));
    }

    #[cfg(test)]
    pub fn open_mock_chip(&self, index: u32, lines: u32) -> Arc<Chip> {
        let chip = crate::chip::mock::mock_chip(index, lines);
        self.register_chip(index, chip.clone());
        chip
    }

    pub fn chip(&self, index: u32) -> Result<Arc<Chip>> {
        self.chips
            .read()
            .unwrap()
            .get(&index)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::BadHandle, "chip not open"))
    }

    /// Closes a chip, cascading to its line groups, scripts, and the
    /// transmission/sampler threads started in `register_chip` (§5).
    pub fn close_chip(&self, index: u32) {
        if let Some(chip) = self.chips.write().unwrap().remove(&index) {
            chip.shut_down();
        }
        self.scripts.write().unwrap().remove(&index);
    }

    // -- line ops, delegating to the named chip -----------------------

    pub fn claim_input(&self, chip: u32, flags: LineFlags, line: u32) -> Result<u32> {
        self.chip(chip)?.claim_input(flags, line)
    }

    pub fn claim_output(&self, chip: u32, flags: LineFlags, line: u32, level: bool) -> Result<u32> {
        self.chip(chip)?.claim_output(flags, line, level)
    }

    pub fn claim_alert(&self, chip: u32, flags: LineFlags, line: u32, debounce_us: u64) -> Result<u32> {
        self.chip(chip)?.claim_alert(flags, line, debounce_us)
    }

    pub fn free(&self, chip: u32, line: u32) -> Result<()> {
        self.chip(chip)?.free(line)
    }

    pub fn tx_pulse(&self, chip: u32, line: u32, on_us: u32, off_us: u32, offset_us: u32, cycles: u32) -> Result<()> {
        let chip = self.chip(chip)?;
        tx::tx_pulse(&chip, line, on_us, off_us, offset_us, cycles)
    }

    pub fn tx_pwm(&self, chip: u32, line: u32, freq_hz: u32, duty_pct: u32, offset_us: u32, cycles: u32) -> Result<()> {
        let chip = self.chip(chip)?;
        tx::tx_pwm(&chip, line, freq_hz, duty_pct, offset_us, cycles)
    }

    pub fn tx_servo(&self, chip: u32, line: u32, pulse_us: u32, freq_hz: u32, offset_us: u32, cycles: u32) -> Result<()> {
        let chip = self.chip(chip)?;
        tx::tx_servo(&chip, line, pulse_us, freq_hz, offset_us, cycles)
    }

    pub fn tx_wave(&self, chip: u32, line: u32, steps: Vec<WaveStep>) -> Result<()> {
        let chip = self.chip(chip)?;
        tx::tx_wave(&chip, line, steps)
    }

    pub fn tx_busy(&self, chip: u32, line: u32, kind: Option<TxKind>) -> Result<bool> {
        let chip = self.chip(chip)?;
        tx::tx_busy(&chip, line, kind)
    }

    pub fn tx_room(&self, chip: u32, line: u32, kind: Option<TxKind>) -> Result<u32> {
        let chip = self.chip(chip)?;
        tx::tx_room(&chip, line, kind)
    }

    // -- bus handles ----------------------------------------------------

    pub fn i2c_open(&self, bus: u32, address: u16, flags: u32) -> Result<Handle> {
        let dev = I2cDevice::open(bus, address, flags)?;
        Ok(self.i2c.lock().unwrap().insert(dev))
    }

    pub fn i2c_close(&self, handle: Handle) -> Result<()> {
        self.i2c.lock().unwrap().remove(handle).map(|_| ())
    }

    pub fn with_i2c<T>(&self, handle: Handle, f: impl FnOnce(&I2cDevice) -> Result<T>) -> Result<T> {
        let table = self.i2c.lock().unwrap();
        f(table.get(handle)?)
    }

    pub fn spi_open(&self, bus: u32, channel: u32, speed_hz: u32, mode: u8) -> Result<Handle> {
        let dev = SpiDevice::open(bus, channel, speed_hz, mode)?;
        Ok(self.spi.lock().unwrap().insert(dev))
    }

    pub fn spi_close(&self, handle: Handle) -> Result<()> {
        self.spi.lock().unwrap().remove(handle).map(|_| ())
    }

    pub fn with_spi<T>(&self, handle: Handle, f: impl FnOnce(&SpiDevice) -> Result<T>) -> Result<T> {
        let table = self.spi.lock().unwrap();
        f(table.get(handle)?)
    }

    pub fn serial_open(&self, path: &str, speed: u32, flags: u32) -> Result<Handle> {
        let dev = SerialDevice::open(path, speed, flags)?;
        Ok(self.serial.lock().unwrap().insert(dev))
    }

    pub fn serial_close(&self, handle: Handle) -> Result<()> {
        self.serial.lock().unwrap().remove(handle).map(|_| ())
    }

    pub fn with_serial_mut<T>(&self, handle: Handle, f: impl FnOnce(&mut SerialDevice) -> Result<T>) -> Result<T> {
        let mut table = self.serial.lock().unwrap();
        f(table.get_mut(handle)?)
    }

    pub fn file_open(&self, path: &str, mode: crate::bus::file::FileMode) -> Result<Handle> {
        let fh = FileHandle::open(path, mode)?;
        Ok(self.files.lock().unwrap().insert(fh))
    }

    pub fn file_close(&self, handle: Handle) -> Result<()> {
        self.files.lock().unwrap().remove(handle).map(|_| ())
    }

    pub fn with_file_mut<T>(&self, handle: Handle, f: impl FnOnce(&mut FileHandle) -> Result<T>) -> Result<T> {
        let mut table = self.files.lock().unwrap();
        f(table.get_mut(handle)?)
    }

    // -- notifiers --------------------------------------------------------

    pub fn notify_open(&self, sink: Sink) -> Handle {
        let notifier = Arc::new(Notifier::new(sink));
        self.dispatcher.register(notifier.clone());
        self.notifiers.lock().unwrap().insert(notifier)
    }

    pub fn notify_close(&self, handle: Handle) -> Result<()> {
        let notifier = self.notifiers.lock().unwrap().remove(handle)?;
        self.dispatcher.unregister(&notifier);
        Ok(())
    }

    pub fn notify_pause(&self, handle: Handle) -> Result<()> {
        self.notifiers.lock().unwrap().get(handle).map(|n| n.pause())
    }

    pub fn notify_resume(&self, handle: Handle) -> Result<()> {
        self.notifiers.lock().unwrap().get(handle).map(|n| n.resume())
    }

    pub fn notify_subscribe(&self, handle: Handle, chip: u16, line: u16) -> Result<()> {
        self.notifiers.lock().unwrap().get(handle).map(|n| n.subscribe(chip, line))
    }

    // -- scripts ------------------------------------------------------

    pub fn script_store(&self, chip: u32, source: &str) -> Result<u32> {
        let scripts = self.scripts.read().unwrap();
        let engine = scripts
            .get(&chip)
            .ok_or_else(|| Error::new(ErrorKind::BadHandle, "chip not open"))?;
        Ok(engine.store(source)?.id)
    }

    fn script_engine(&self, chip: u32) -> Result<Arc<script::ScriptEngine>> {
        self.scripts
            .read()
            .unwrap()
            .get(&chip)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::BadHandle, "chip not open"))
    }

    pub fn script_run(&self, chip: u32, id: u32, params: &[i64]) -> Result<()> {
        self.script_engine(chip)?.run(id, params)
    }

    pub fn script_stop(&self, chip: u32, id: u32) -> Result<()> {
        self.script_engine(chip)?.stop(id)
    }

    pub fn script_status(&self, chip: u32, id: u32) -> Result<(script::ScriptState, [i64; script::NUM_PARAMS])> {
        self.script_engine(chip)?.status(id)
    }

    pub fn script_update(&self, chip: u32, id: u32, params: &[i64]) -> Result<()> {
        self.script_engine(chip)?.update(id, params)
    }

    pub fn script_delete(&self, chip: u32, id: u32) -> Result<()> {
        self.script_engine(chip)?.delete(id)
    }

    pub fn share_handles(&self, share_id: ShareId, handle: Handle) {
        self.ownership.record(handle, share_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_claim_and_tx_pulse_on_a_mock_chip() {
        let engine = Engine::new();
        engine.open_mock_chip(0, 32);
        engine.claim_output(0, LineFlags::empty(), 21, false).unwrap();
        engine.tx_pulse(0, 21, 500, 500, 0, 1).unwrap();
        assert!(engine.tx_busy(0, 21, None).unwrap());
    }

    #[test]
    fn script_lifecycle_through_the_engine_facade() {
        let engine = Engine::new();
        engine.open_mock_chip(0, 32);
        let id = engine.script_store(0, "halt").unwrap();
        engine.script_run(0, id, &[]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (state, _params) = engine.script_status(0, id).unwrap();
        assert_eq!(state, script::ScriptState::Halted);
        engine.script_delete(0, id).unwrap();
    }
}
