//! In-flight window flow control
//!
//! The send task counts every acknowledged command it writes; the receive task
//! counts replies back down. When `max_in_flight` commands are outstanding the
//! gate closes and the send task waits for it to reopen.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug)]
struct FlowState {
    in_flight: usize,
    gate_open: bool,
}

/// Per-link flow-control window shared by the send and receive tasks
#[derive(Debug)]
pub struct FlowWindow {
    max_in_flight: usize,
    state: Mutex<FlowState>,
    opened: Notify,
}

impl FlowWindow {
    /// Create a window; `max_in_flight == 0` disables accounting
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight,
            state: Mutex::new(FlowState {
                in_flight: 0,
                gate_open: true,
            }),
            opened: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Whether this link tracks acknowledgements at all
    pub fn is_tracking(&self) -> bool {
        self.max_in_flight > 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn is_open(&self) -> bool {
        self.lock().gate_open
    }

    /// Count one written command; returns true if this closed the gate
    pub fn record_sent(&self) -> bool {
        if !self.is_tracking() {
            return false;
        }

        let mut state = self.lock();
        state.in_flight += 1;
        if state.gate_open && state.in_flight >= self.max_in_flight {
            state.gate_open = false;
            debug!(
                in_flight = state.in_flight,
                max_in_flight = self.max_in_flight,
                "Enabling flow control"
            );
            return true;
        }
        false
    }

    /// Count one reply; returns false if there was nothing in flight (desync)
    pub fn record_ack(&self) -> bool {
        if !self.is_tracking() {
            return true;
        }

        let mut state = self.lock();
        let counted = match state.in_flight.checked_sub(1) {
            Some(n) => {
                state.in_flight = n;
                true
            }
            None => {
                warn!("Received more replies than commands were sent, resetting window");
                false
            }
        };

        if !state.gate_open && state.in_flight < self.max_in_flight {
            state.gate_open = true;
            drop(state);
            self.opened.notify_one();
        }
        counted
    }

    /// Drop all outstanding accounting and open the gate
    pub fn force_reset(&self) {
        let mut state = self.lock();
        state.in_flight = 0;
        state.gate_open = true;
        drop(state);
        self.opened.notify_one();
    }

    /// Wait until the gate is open; returns false if `timeout` elapsed first
    pub async fn wait_open(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let opened = self.opened.notified();
                if self.is_open() {
                    return;
                }
                opened.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;

    #[test]
    fn test_gate_closes_when_window_full() {
        let flow = FlowWindow::new(2);
        assert!(!flow.record_sent());
        assert!(flow.is_open());
        assert!(flow.record_sent());
        assert!(!flow.is_open());
        assert_eq!(flow.in_flight(), 2);

        assert!(flow.record_ack());
        assert!(flow.is_open());
        assert_eq!(flow.in_flight(), 1);
    }

    #[test]
    fn test_desync_clamps_to_zero() {
        let flow = FlowWindow::new(3);
        assert!(!flow.record_ack());
        assert_eq!(flow.in_flight(), 0);
        assert!(flow.is_open());
    }

    #[test]
    fn test_untracked_window_never_closes() {
        let flow = FlowWindow::new(0);
        for _ in 0..100 {
            assert!(!flow.record_sent());
        }
        assert_eq!(flow.in_flight(), 0);
        assert!(flow.is_open());
    }

    #[test]
    fn test_random_interleaving_stays_within_bounds() {
        let mut rng = rand::thread_rng();
        let flow = FlowWindow::new(4);
        let mut model: usize = 0;
        for _ in 0..10_000 {
            if rng.gen_bool(0.5) {
                flow.record_sent();
                model += 1;
            } else {
                flow.record_ack();
                model = model.saturating_sub(1);
            }
            assert_eq!(flow.in_flight(), model);
            assert_eq!(flow.is_open(), model < 4 || !flow.is_tracking());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_open_times_out_while_closed() {
        let flow = FlowWindow::new(1);
        flow.record_sent();
        assert!(!flow.wait_open(Duration::from_secs(1)).await);
        flow.force_reset();
        assert!(flow.wait_open(Duration::from_secs(1)).await);
        assert_eq!(flow.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_ack_wakes_waiter() {
        let flow = Arc::new(FlowWindow::new(1));
        flow.record_sent();

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.wait_open(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        flow.record_ack();
        assert!(waiter.await.unwrap());
    }
}
