//! Engine shutdown coordination
//!
//! One handle shared by the dispatcher and the consumer manager: a flag
//! that stops new work from starting and a broadcast channel that cancels
//! work already in flight.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

pub struct Shutdown {
    triggered: AtomicBool,
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            triggered: AtomicBool::new(false),
            tx,
        }
    }

    /// Flags shutdown and wakes everything selecting on [`subscribe`].
    ///
    /// [`subscribe`]: Shutdown::subscribe
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_subscribers() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!shutdown.is_triggered());

        shutdown.trigger();
        assert!(shutdown.is_triggered());
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn late_subscribers_see_the_flag() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        // The broadcast may be missed by late subscribers; the flag is the
        // source of truth.
        assert!(shutdown.is_triggered());
    }
}
