//! 🛑 Cooperative stop signals for the long-running loops.
//!
//! The producer checks once per tick, the consumer once per batch. Nobody gets
//! interrupted mid-write. It's a polite "please wrap up", not a `kill -9`.

use tokio::sync::watch;

/// 🔔 The sending half. Whoever owns this decides when the party is over.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// 👂 The receiving half. Cheap to clone, one per loop.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

/// 🏗️ Build a connected handle/signal pair.
pub fn stop_pair() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

impl StopHandle {
    /// 🛑 Ask every loop holding a matching [`StopSignal`] to stop at its next checkpoint.
    pub fn stop(&self) {
        // send_replace never fails, even with zero receivers left
        self.tx.send_replace(true);
    }

    /// 👂 Another receiver for the same stop.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    /// 🕳️ A signal that never fires. For runs bounded by something else (a window, a test).
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// ❓ Has a stop been requested?
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// ⏳ Resolve once a stop is requested. Pends forever if the handle was dropped unfired.
    pub async fn stopped(&mut self) {
        let fired = self.rx.wait_for(|stopped| *stopped).await.is_ok();
        if !fired {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn the_one_where_stop_reaches_every_clone() {
        let (handle, signal) = stop_pair();
        let mut sibling = signal.clone();
        let mut late_joiner = handle.signal();
        assert!(!signal.is_stopped());

        handle.stop();

        assert!(signal.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), sibling.stopped())
            .await
            .expect("💀 clone never heard the stop");
        tokio::time::timeout(Duration::from_secs(1), late_joiner.stopped())
            .await
            .expect("💀 late subscriber never heard the stop");
    }

    #[tokio::test]
    async fn the_one_where_never_means_never() {
        let mut signal = StopSignal::never();
        assert!(!signal.is_stopped());
        let waited = tokio::time::timeout(Duration::from_millis(50), signal.stopped()).await;
        assert!(waited.is_err(), "a never-signal should not resolve");
    }
}
