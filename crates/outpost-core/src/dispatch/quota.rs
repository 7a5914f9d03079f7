//! Send quota - rolling 24 hour recipient counter

use outpost_common::types::SendQuota;
use outpost_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct QuotaState {
    max_24_hour_send: u64,
    max_send_rate: f64,
    window: Duration,
    /// Recipients counted in the current window, including open reservations
    sent: AtomicU64,
    /// Committed reservations, oldest first
    committed: Mutex<VecDeque<(Instant, u64)>>,
}

/// Account-wide quota.
///
/// Admission is a single compare-and-swap on `sent`; the committed list is
/// only bookkeeping for expiring old reservations out of the window.
#[derive(Debug, Clone)]
pub struct SendQuotaTracker {
    state: Arc<QuotaState>,
}

impl SendQuotaTracker {
    pub fn new(max_24_hour_send: u64, max_send_rate: f64) -> Self {
        Self::with_window(max_24_hour_send, max_send_rate, WINDOW)
    }

    pub fn with_window(max_24_hour_send: u64, max_send_rate: f64, window: Duration) -> Self {
        Self {
            state: Arc::new(QuotaState {
                max_24_hour_send,
                max_send_rate,
                window,
                sent: AtomicU64::new(0),
                committed: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Reserve `recipients` against the quota.
    ///
    /// The reservation is released when dropped unless it is committed.
    pub fn reserve(&self, recipients: u64) -> Result<QuotaReservation> {
        self.refresh();

        let max = self.state.max_24_hour_send;
        self.state
            .sent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |sent| {
                sent.checked_add(recipients).filter(|total| *total <= max)
            })
            .map_err(|sent| {
                Error::LimitExceeded(format!(
                    "daily message quota exceeded ({} of {} used, {} requested)",
                    sent, max, recipients
                ))
            })?;

        Ok(QuotaReservation {
            state: self.state.clone(),
            amount: recipients,
            committed: false,
        })
    }

    /// Expire reservations older than the window
    pub fn refresh(&self) {
        let now = Instant::now();
        let mut expired = 0u64;
        {
            let mut committed = self.state.committed.lock();
            while let Some((at, amount)) = committed.front().copied() {
                if now.duration_since(at) < self.state.window {
                    break;
                }
                committed.pop_front();
                expired += amount;
            }
        }
        if expired > 0 {
            self.state.sent.fetch_sub(expired, Ordering::AcqRel);
            debug!(expired, "Expired quota reservations");
        }
    }

    pub fn sent_last_24_hours(&self) -> u64 {
        self.state.sent.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> SendQuota {
        self.refresh();
        SendQuota {
            max_24_hour_send: self.state.max_24_hour_send,
            sent_last_24_hours: self.sent_last_24_hours(),
            max_send_rate: self.state.max_send_rate,
        }
    }
}

/// Recipients held against the quota for one message
#[derive(Debug)]
pub struct QuotaReservation {
    state: Arc<QuotaState>,
    amount: u64,
    committed: bool,
}

impl QuotaReservation {
    /// Keep the reservation; it now counts until it ages out of the window
    pub fn commit(mut self) {
        self.committed = true;
        self.state
            .committed
            .lock()
            .push_back((Instant::now(), self.amount));
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if !self.committed {
            self.state.sent.fetch_sub(self.amount, Ordering::AcqRel);
        }
    }
}
