//! Main-execution dispatcher.
//!
//! Background tasks (network callbacks, cache misses, import completions)
//! never touch engine-owned single-threaded state directly. They enqueue
//! deferred actions here; the presentation engine's update loop drains the
//! whole queue once per tick, in enqueue order, on its own thread. This is a
//! message-passing boundary, not a lock. Actions must not block; anything
//! long-running belongs upstream of the enqueue.

use tokio::sync::mpsc;
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable producer handle; safe to use from any task or thread.
#[derive(Clone)]
pub struct MainDispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

/// The single consumer, pumped by the engine's per-tick update.
pub struct DispatcherPump {
    rx: mpsc::UnboundedReceiver<Job>,
}

/// Creates the producer handle and the consumer pump.
pub fn main_dispatcher() -> (MainDispatcher, DispatcherPump) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MainDispatcher { tx }, DispatcherPump { rx })
}

impl MainDispatcher {
    /// Schedules `job` for the next tick. Returns false if the consumer is
    /// gone and the job was dropped.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(job)).is_ok()
    }
}

impl DispatcherPump {
    /// Runs every currently-queued action in enqueue order and returns how
    /// many ran. Never blocks waiting for producers.
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        if ran > 0 {
            trace!(ran, "main dispatcher drained");
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn drains_in_enqueue_order_across_producers() {
        let (dispatcher, mut pump) = main_dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));

        // Three producer contexts, completion order enforced by joining each
        // thread before the next starts.
        for label in ["A", "B", "C"] {
            let dispatcher = dispatcher.clone();
            let seen = seen.clone();
            std::thread::spawn(move || {
                assert!(dispatcher.enqueue(move || seen.lock().unwrap().push(label)));
            })
            .join()
            .unwrap();
        }

        assert_eq!(pump.drain(), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[test]
    fn drain_returns_zero_on_empty_queue() {
        let (_dispatcher, mut pump) = main_dispatcher();
        assert_eq!(pump.drain(), 0);
    }

    #[test]
    fn enqueue_after_consumer_drop_reports_failure() {
        let (dispatcher, pump) = main_dispatcher();
        drop(pump);
        assert!(!dispatcher.enqueue(|| {}));
    }
}
