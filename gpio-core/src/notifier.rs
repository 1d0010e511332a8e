//! Notifiers: the out-of-band report stream a client subscribes to, and
//! the in-process callback mechanism, modelled as the same kind of sink
//! fed by the same report stream (§4.3, §9 "Callback layering").

use std::{
    collections::{HashSet, VecDeque},
    io::Write,
    sync::{Arc, Condvar, Mutex},
};

use crate::report::{Report, ReportFlags};

pub const DEFAULT_QUEUE_DEPTH: usize = 4096;

/// Where a notifier's reports ultimately go.
pub enum Sink {
    /// A local in-process handler, invoked with a batch of reports; the
    /// dispatcher never calls this while holding a chip lock (§4.3).
    Callback(Box<dyn Fn(&[Report]) + Send + Sync>),
    /// A FIFO the daemon exposes to a remote client; each `Report` is
    /// serialised to the 24-byte wire record (§4.4) before writing.
    Fifo(std::fs::File),
}

struct Queue {
    reports: VecDeque<Report>,
    stop: bool,
}

/// A notifier's bounded backlog and the background thread that drains
/// it. `deliver` only ever touches the queue under its own short lock;
/// writing to the sink (which can block, e.g. a full FIFO) happens on
/// the drain thread so a slow subscriber never stalls the sampler that
/// called `deliver` (§4.3).
pub struct Notifier {
    pub subscriptions: Mutex<HashSet<(u16, u16)>>,
    pub paused: std::sync::atomic::AtomicBool,
    pub sequence: Arc<std::sync::atomic::AtomicU32>,
    queue: Arc<(Mutex<Queue>, Condvar)>,
    depth: usize,
    drain_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Notifier {
    pub fn new(sink: Sink) -> Self {
        Self::with_depth(sink, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_depth(sink: Sink, depth: usize) -> Self {
        let queue = Arc::new((
            Mutex::new(Queue {
                reports: VecDeque::new(),
                stop: false,
            }),
            Condvar::new(),
        ));
        let sequence = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let drain_thread = spawn_drain(queue.clone(), sink, sequence.clone());
        Self {
            subscriptions: Mutex::new(HashSet::new()),
            paused: std::sync::atomic::AtomicBool::new(false),
            sequence,
            queue,
            depth,
            drain_thread: Mutex::new(Some(drain_thread)),
        }
    }

    pub fn subscribe(&self, chip: u16, line: u16) {
        self.subscriptions.lock().unwrap().insert((chip, line));
    }

    pub fn unsubscribe(&self, chip: u16, line: u16) {
        self.subscriptions.lock().unwrap().remove(&(chip, line));
    }

    pub fn is_subscribed(&self, chip: u16, line: u16) -> bool {
        self.subscriptions.lock().unwrap().contains(&(chip, line))
    }

    pub fn pause(&self) {
        self.paused.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Appends `report` to this notifier's bounded queue, applying the
    /// drop-oldest-plus-marker backpressure policy on overflow, and
    /// wakes the drain thread. The sequence counter advances by exactly
    /// 1 whether the report lands or is replaced by an overflow marker;
    /// delivery to the sink happens asynchronously on the drain thread,
    /// so a slow or stalled sink backs up the queue instead of this
    /// call (§4.3).
    pub fn deliver(&self, report: Report) {
        if self.paused.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let (lock, condvar) = &*self.queue;
        let mut queue = lock.lock().unwrap();
        if queue.reports.len() >= self.depth {
            queue.reports.pop_front();
            queue
                .reports
                .push_back(Report::overflow_marker(report.chip, report.line, report.timestamp_ns));
        } else {
            queue.reports.push_back(report);
        }
        self.sequence.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        condvar.notify_one();
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.queue.0.lock().unwrap().stop = true;
        self.queue.1.notify_one();
        if let Some(handle) = self.drain_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Runs on its own thread for the life of a `Notifier`, blocking on the
/// condvar between batches so it costs nothing while the queue is
/// empty; each popped report is flushed to `sink` outside the queue
/// lock so a slow `Sink::Fifo` write never blocks `deliver`.
fn spawn_drain(
    queue: Arc<(Mutex<Queue>, Condvar)>,
    sink: Sink,
    sequence: Arc<std::sync::atomic::AtomicU32>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let (lock, condvar) = &*queue;
        loop {
            let report = {
                let mut q = lock.lock().unwrap();
                loop {
                    if let Some(report) = q.reports.pop_front() {
                        break Some(report);
                    }
                    if q.stop {
                        break None;
                    }
                    q = condvar.wait(q).unwrap();
                }
            };
            let Some(report) = report else { return };
            match &sink {
                Sink::Callback(f) => f(&[report]),
                Sink::Fifo(file) => {
                    let seq = sequence.load(std::sync::atomic::Ordering::SeqCst);
                    let record = encode_record(seq, report);
                    // A send-only Mutex<File> would be cleaner, but `File`'s
                    // write is already append-atomic enough for our 24-byte
                    // records on a pipe; lock at the call site in `dispatcher`.
                    let _ = (&*file).write_all(&record);
                }
            }
        }
    })
}

/// Encodes one report as the 24-byte little-endian notification record
/// from §4.4: `(sequence, flags, chip, line, timestamp_ns, level, pad)`.
pub fn encode_record(sequence: u32, report: Report) -> [u8; 24] {
    let mut buf = [0u8; 24];
    buf[0..4].copy_from_slice(&sequence.to_le_bytes());
    buf[4..6].copy_from_slice(&(report.flags.bits() as u16).to_le_bytes());
    buf[6..8].copy_from_slice(&report.chip.to_le_bytes());
    buf[8..12].copy_from_slice(&(report.line as u32).to_le_bytes());
    buf[12..20].copy_from_slice(&report.timestamp_ns.to_le_bytes());
    buf[20] = report.level;
    buf[21..24].fill(0);
    buf
}

pub fn decode_record(buf: &[u8; 24]) -> (u32, ReportFlags, Report) {
    let sequence = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let flags = ReportFlags::from_bits_truncate(u16::from_le_bytes(buf[4..6].try_into().unwrap()) as u8);
    let chip = u16::from_le_bytes(buf[6..8].try_into().unwrap());
    let line = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as u16;
    let timestamp_ns = u64::from_le_bytes(buf[12..20].try_into().unwrap());
    let level = buf[20];
    (
        sequence,
        flags,
        Report {
            timestamp_ns,
            chip,
            line,
            level,
            flags,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};

    #[test]
    fn sequence_advances_once_per_report_or_marker() {
        let notifier = Notifier::with_depth(Sink::Callback(Box::new(|_| {})), 2);
        for i in 0..5 {
            notifier.deliver(Report::edge(0, 0, true, i));
        }
        assert_eq!(notifier.sequence.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn callback_sink_receives_reports() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let notifier = Notifier::new(Sink::Callback(Box::new(move |batch| {
            count2.fetch_add(batch.len(), Ordering::SeqCst);
        })));
        notifier.deliver(Report::edge(0, 1, true, 10));
        wait_until(|| count.load(Ordering::SeqCst) == 1);
    }

    #[test]
    fn paused_notifier_drops_reports_without_advancing_sequence() {
        let notifier = Notifier::new(Sink::Callback(Box::new(|_| {})));
        notifier.pause();
        notifier.deliver(Report::edge(0, 1, true, 10));
        assert_eq!(notifier.sequence.load(Ordering::SeqCst), 0);
    }

    /// Depth=1 queue: hold the drain thread inside its first callback
    /// so the next two deliveries land while the queue is genuinely
    /// full, forcing the drop-oldest-plus-marker path, then release it
    /// and check the marker actually made it to the sink.
    #[test]
    fn overflowing_the_queue_emits_a_single_overflow_marker() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let entered_tx = Mutex::new(Some(entered_tx));
        let release_rx = Mutex::new(release_rx);
        let first = std::sync::atomic::AtomicBool::new(true);
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();

        let notifier = Notifier::with_depth(
            Sink::Callback(Box::new(move |batch| {
                received2.lock().unwrap().extend_from_slice(batch);
                if first.swap(false, Ordering::SeqCst) {
                    if let Some(tx) = entered_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    let _ = release_rx.lock().unwrap().recv();
                }
            })),
            1,
        );

        notifier.deliver(Report::edge(0, 0, true, 0));
        entered_rx.recv().unwrap();
        for i in 1..4 {
            notifier.deliver(Report::edge(0, 0, true, i));
        }
        release_tx.send(()).unwrap();

        wait_until(|| received.lock().unwrap().len() >= 2);
        assert!(received
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.flags.contains(ReportFlags::OVERFLOW)));
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(cond(), "condition did not become true in time");
    }

    #[test]
    fn record_roundtrips() {
        let report = Report::edge(3, 21, true, 123_456_789);
        let buf = encode_record(7, report);
        let (seq, flags, decoded) = decode_record(&buf);
        assert_eq!(seq, 7);
        assert_eq!(flags, ReportFlags::EDGE);
        assert_eq!(decoded.chip, 3);
        assert_eq!(decoded.line, 21);
        assert_eq!(decoded.level, 1);
    }
}
