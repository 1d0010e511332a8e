//! Fans sampler-produced reports out to every notifier subscribed to
//! the report's `(chip, line)` pair (§4.3).

use std::sync::{Arc, RwLock};

use crate::{notifier::Notifier, report::Report};

#[derive(Default)]
pub struct Dispatcher {
    notifiers: RwLock<Vec<Arc<Notifier>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, notifier: Arc<Notifier>) {
        self.notifiers.write().unwrap().push(notifier);
    }

    pub fn unregister(&self, notifier: &Arc<Notifier>) {
        self.notifiers
            .write()
            .unwrap()
            .retain(|n| !Arc::ptr_eq(n, notifier));
    }

    /// Delivers `report` to every notifier subscribed to its
    /// `(chip, line)` pair. Must be called with no chip lock held.
    pub fn dispatch(&self, report: Report) {
        let notifiers = self.notifiers.read().unwrap();
        for notifier in notifiers.iter() {
            if notifier.is_subscribed(report.chip, report.line) {
                notifier.deliver(report);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Sink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn only_subscribed_notifiers_receive_the_report() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let subscribed = Arc::new(Notifier::new(Sink::Callback(Box::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }))));
        subscribed.subscribe(0, 5);
        let unsubscribed = Arc::new(Notifier::new(Sink::Callback(Box::new(|_| {
            panic!("should not be invoked");
        }))));
        dispatcher.register(subscribed.clone());
        dispatcher.register(unsubscribed.clone());

        dispatcher.dispatch(Report::edge(0, 5, true, 1));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
