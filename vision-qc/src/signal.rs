//! Edge-triggered signal flags shared between tasks.
//!
//! Modeled as single-slot `watch` channels: tasks only set or clear, never
//! read-modify-write. Cloning yields another handle onto the same flag.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Signal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn set(&self) {
        let _ = self.tx.send(true);
    }

    pub fn clear(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Suspend until the flag is set.
    pub async fn wait_set(&mut self) {
        let _ = self.rx.wait_for(|v| *v).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn set_wakes_waiters() {
        let sig = Signal::new();
        let mut waiter = sig.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_set().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        sig.set();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn clear_resets_the_flag() {
        let sig = Signal::new();
        sig.set();
        assert!(sig.is_set());
        sig.clear();
        assert!(!sig.is_set());
    }
}
