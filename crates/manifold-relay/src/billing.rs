//! Quota reservation and settlement.
//!
//! Before dispatch the estimated prompt cost is reserved against the
//! caller's token; on success the balance is reconciled to the observed
//! usage; every other outcome releases the reservation in full, including
//! a dropped connection (the reservation guard releases on drop).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use manifold_adaptor::{ModelPrice, quota_cost, reservation_cost};
use manifold_core::{RelayError, Result, Token, TokenStore, Usage};

pub struct Biller {
    store: Arc<dyn TokenStore>,
    quota_per_token: f64,
    group_ratios: HashMap<String, f64>,
}

/// A held reservation. Settle or let it drop; dropping releases the
/// reserved amount in the background so cancelled requests are not charged.
pub struct Reservation {
    store: Arc<dyn TokenStore>,
    pub token_id: i64,
    pub amount: i64,
    closed: AtomicBool,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("token_id", &self.token_id)
            .field("amount", &self.amount)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Biller {
    pub fn new(
        store: Arc<dyn TokenStore>,
        quota_per_token: f64,
        group_ratios: HashMap<String, f64>,
    ) -> Self {
        Self {
            store,
            quota_per_token,
            group_ratios,
        }
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratios.get(group).copied().unwrap_or(1.0)
    }

    /// Reserve the estimated prompt cost. Failure is the caller's own
    /// quota running out: a terminal 403, never retried.
    pub async fn pre_consume(
        &self,
        token: &Token,
        prompt_tokens: u64,
        price: &ModelPrice,
        group: &str,
    ) -> Result<Reservation> {
        let amount = reservation_cost(
            prompt_tokens,
            price,
            self.group_ratio(group),
            self.quota_per_token,
        );
        if amount > 0 {
            self.store.adjust_quota(token.id, -amount).await.map_err(|e| {
                if e.kind == manifold_core::ErrorKind::InsufficientQuota {
                    RelayError::insufficient_quota("insufficient token quota")
                } else {
                    e
                }
            })?;
        }
        debug!(token_id = token.id, amount, "quota reserved");
        Ok(Reservation {
            store: Arc::clone(&self.store),
            token_id: token.id,
            amount,
            closed: AtomicBool::new(false),
        })
    }

    /// Reconcile the reservation against observed usage. Returns the final
    /// cost in quota units.
    pub async fn settle(
        &self,
        reservation: &Reservation,
        usage: &Usage,
        price: &ModelPrice,
        group: &str,
    ) -> Result<i64> {
        let cost = quota_cost(usage, price, self.group_ratio(group), self.quota_per_token);
        let delta = reservation.amount - cost;
        reservation.closed.store(true, Ordering::SeqCst);
        if delta != 0 {
            // A positive delta refunds; negative charges the shortfall. The
            // shortfall charge may overdraft slightly, which is accepted —
            // the work already happened.
            if let Err(e) = self.store.adjust_quota(reservation.token_id, delta).await {
                warn!(token_id = reservation.token_id, delta, error = %e, "settlement adjustment failed");
            }
        }
        debug!(
            token_id = reservation.token_id,
            reserved = reservation.amount,
            cost,
            "quota settled"
        );
        Ok(cost)
    }

    /// Give the whole reservation back.
    pub async fn release(&self, reservation: &Reservation) {
        if reservation.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if reservation.amount > 0
            && let Err(e) = self
                .store
                .adjust_quota(reservation.token_id, reservation.amount)
                .await
        {
            warn!(token_id = reservation.token_id, error = %e, "reservation release failed");
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) || self.amount == 0 {
            return;
        }
        let store = Arc::clone(&self.store);
        let token_id = self.token_id;
        let amount = self.amount;
        // Dropped without settle/release: the request was cancelled
        // mid-flight. Refund out-of-band.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.adjust_quota(token_id, amount).await {
                    warn!(token_id, amount, error = %e, "cancellation refund failed");
                }
            });
        }
    }
}
