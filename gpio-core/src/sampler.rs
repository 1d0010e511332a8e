//! The edge sampler: one background thread per chip that drains kernel
//! line-events, applies debounce/watchdog, and produces `Report`s for
//! the dispatcher (§4.3).

use std::{
    sync::Arc,
    time::Duration,
};

use crate::{
    chip::Chip,
    dispatcher::Dispatcher,
    report::Report,
    time::now_ns,
};

/// How often the sampler polls each claimed group for pending events
/// and checks watchdog expiry, absent a real blocking-read primitive
/// for the mock backend used in tests.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub fn spawn(chip: Arc<Chip>, dispatcher: Arc<Dispatcher>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || run(chip, dispatcher))
}

fn run(chip: Arc<Chip>, dispatcher: Arc<Dispatcher>) {
    loop {
        if chip.is_shutting_down() {
            return;
        }
        let events = {
            let state = chip.state.lock().unwrap();
            let mut collected = Vec::new();
            for (&first, group) in state.groups.iter() {
                match group.raw.poll_events() {
                    Ok(evs) => collected.extend(evs.into_iter().map(|e| (first, e))),
                    Err(err) => tracing::warn!(chip = chip.index, error = %err, "edge poll failed"),
                }
            }
            collected
        };

        for (first, event) in events {
            let now = now_ns();
            let mut state = chip.state.lock().unwrap();
            let Some(group) = state.groups.get_mut(&first) else { continue };
            let Some(pos) = group.offsets.iter().position(|&o| o == event.offset) else { continue };
            let lcb = &mut group.lcbs[pos];
            let since_last = now.saturating_sub(lcb.last_edge_ts);
            if lcb.debounce_us > 0 && since_last < lcb.debounce_us * 1000 && lcb.last_edge_ts != 0 {
                lcb.last_edge_ts = now;
                continue;
            }
            lcb.last_edge_ts = now;
            lcb.last_report_ts = now;
            lcb.level = event.rising;
            let report = Report::edge(chip.index as u16, event.offset as u16, event.rising, now);
            drop(state);
            dispatcher.dispatch(report);
        }

        check_watchdogs(&chip, &dispatcher);

        std::thread::sleep(POLL_INTERVAL);
    }
}

fn check_watchdogs(chip: &Arc<Chip>, dispatcher: &Arc<Dispatcher>) {
    let now = now_ns();
    let mut due = Vec::new();
    {
        let mut state = chip.state.lock().unwrap();
        for (&first, group) in state.groups.iter_mut() {
            for (pos, lcb) in group.lcbs.iter_mut().enumerate() {
                if lcb.watchdog_us == 0 {
                    continue;
                }
                let baseline = if lcb.last_report_ts == 0 { lcb.last_edge_ts } else { lcb.last_report_ts };
                let elapsed = now.saturating_sub(baseline);
                if elapsed >= lcb.watchdog_us * 1000 {
                    lcb.last_report_ts = now;
                    due.push((group.offsets[pos], first));
                }
            }
        }
    }
    for (offset, _first) in due {
        dispatcher.dispatch(Report::watchdog(chip.index as u16, offset as u16, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::mock::mock_chip;
    use crate::lcb::LineFlags;
    use crate::notifier::{Notifier, Sink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn watchdog_fires_once_per_period_with_no_edges() {
        let chip = mock_chip(0, 32);
        chip.claim_alert(LineFlags::empty(), 5, 0).unwrap();
        chip.set_watchdog(5, 1).unwrap();

        let dispatcher = Arc::new(Dispatcher::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let notifier = Arc::new(Notifier::new(Sink::Callback(Box::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }))));
        notifier.subscribe(0, 5);
        dispatcher.register(notifier);

        let handle = spawn(chip.clone(), dispatcher);
        std::thread::sleep(Duration::from_millis(30));
        let observed = hits.load(Ordering::SeqCst);
        assert!(observed >= 1, "expected at least one watchdog report, got {observed}");
        drop(chip);
        let _ = handle;
    }
}
