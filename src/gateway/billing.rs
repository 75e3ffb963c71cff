//! Spend-based admission control.
//!
//! Each organization's wallet is a serialized actor holding a fixed-point balance, the set
//! of in-flight attempt ids, and a count of settled requests whose cost is still unknown. A
//! forward is admitted only when the balance covers the minimum and the in-flight count stays
//! within a balance-scaled ceiling.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::actor::{KeyedActors, actor_name};
use super::ids::generate_uuid;
use super::store::OrganizationRecord;
use super::tasks::BackgroundTasks;

/// Balance units per cent.
pub const SCALE_FACTOR: i128 = 10_000_000_000;
/// Balances at or below this many cents are refused outright.
pub const MINIMUM_BALANCE_CENTS: i128 = 10;

pub fn cents_to_scaled(cents: f64) -> i128 {
    (cents * SCALE_FACTOR as f64).round() as i128
}

/// In-flight ceiling for a balance, before any unknown-cost reduction.
pub fn max_inflight_for_cents(balance_cents: i128) -> u32 {
    match balance_cents {
        ..10 => 0,
        10..20 => 5,
        20..100 => 10,
        100..500 => 100,
        _ => 500,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    BalanceTooLow { balance_cents: i128 },
    TooManyInflight { inflight: u32, max_inflight: u32 },
    ReducedLimits { inflight: u32, max_inflight: u32 },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::BalanceTooLow { balance_cents } => write!(
                f,
                "balance too low: {balance_cents} cents available, more than {MINIMUM_BALANCE_CENTS} required"
            ),
            DenialReason::TooManyInflight {
                inflight,
                max_inflight,
            } => write!(
                f,
                "too many concurrent requests for the current balance ({inflight} > {max_inflight})"
            ),
            DenialReason::ReducedLimits {
                inflight,
                max_inflight,
            } => write!(
                f,
                "reduced limits while request costs are pending reconciliation ({inflight} > {max_inflight})"
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved { inflight: u32, max_inflight: u32 },
    Denied(DenialReason),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub balance_cents: i128,
    pub inflight: u32,
    pub unknown_cost_count: u32,
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("{0}")]
    Denied(DenialReason),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error("wallet call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Default)]
pub struct WalletState {
    pub balance: i128,
    pub inflight: HashSet<String>,
    pub unknown_cost_count: u32,
    processed_events: HashSet<String>,
}

impl WalletState {
    pub fn balance_cents(&self) -> i128 {
        self.balance.div_euclid(SCALE_FACTOR)
    }

    pub fn reserve(&mut self, attempt_id: &str) -> ReserveOutcome {
        let balance_cents = self.balance_cents();
        if balance_cents <= MINIMUM_BALANCE_CENTS {
            return ReserveOutcome::Denied(DenialReason::BalanceTooLow { balance_cents });
        }
        let mut max_inflight = max_inflight_for_cents(balance_cents);
        let reduced = self.unknown_cost_count > 0;
        if reduced {
            max_inflight /= 2;
        }
        let inflight = u32::try_from(self.inflight.len())
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        if inflight > max_inflight {
            return ReserveOutcome::Denied(if reduced {
                DenialReason::ReducedLimits {
                    inflight,
                    max_inflight,
                }
            } else {
                DenialReason::TooManyInflight {
                    inflight,
                    max_inflight,
                }
            });
        }
        self.inflight.insert(attempt_id.to_string());
        ReserveOutcome::Reserved {
            inflight,
            max_inflight,
        }
    }

    /// Credits are applied once per payment event id.
    pub fn add_credits(&mut self, amount: i128, event_id: &str) -> bool {
        if !self.processed_events.insert(event_id.to_string()) {
            return false;
        }
        self.balance += amount;
        true
    }

    pub fn snapshot(&self) -> WalletSnapshot {
        WalletSnapshot {
            balance_cents: self.balance_cents(),
            inflight: u32::try_from(self.inflight.len()).unwrap_or(u32::MAX),
            unknown_cost_count: self.unknown_cost_count,
        }
    }
}

/// One serialized wallet per organization.
#[async_trait]
pub trait WalletActor: Send + Sync {
    async fn reserve(
        &self,
        organization_id: &str,
        attempt_id: &str,
    ) -> Result<ReserveOutcome, WalletError>;

    /// Removes `attempt_id` from the in-flight set. Returns whether it was present.
    async fn release(&self, organization_id: &str, attempt_id: &str) -> Result<bool, WalletError>;

    /// Debits `cost` (scaled) and releases the attempt.
    async fn settle(
        &self,
        organization_id: &str,
        attempt_id: &str,
        cost: i128,
    ) -> Result<(), WalletError>;

    /// Releases the attempt without a debit and records that its cost is unknown.
    async fn mark_unknown_cost(
        &self,
        organization_id: &str,
        attempt_id: &str,
    ) -> Result<(), WalletError>;

    /// Debits a reconciled cost for an earlier unknown-cost request.
    async fn settle_unknown_cost(&self, organization_id: &str, cost: i128)
    -> Result<(), WalletError>;

    async fn add_credits(
        &self,
        organization_id: &str,
        amount: i128,
        event_id: &str,
    ) -> Result<bool, WalletError>;

    async fn snapshot(&self, organization_id: &str) -> Result<WalletSnapshot, WalletError>;
}

#[derive(Default)]
pub struct MemoryWallets {
    actors: KeyedActors<WalletState>,
}

impl MemoryWallets {
    fn name(organization_id: &str) -> String {
        actor_name("wallet", organization_id)
    }
}

#[async_trait]
impl WalletActor for MemoryWallets {
    async fn reserve(
        &self,
        organization_id: &str,
        attempt_id: &str,
    ) -> Result<ReserveOutcome, WalletError> {
        Ok(self
            .actors
            .with(&Self::name(organization_id), |wallet| wallet.reserve(attempt_id))
            .await)
    }

    async fn release(&self, organization_id: &str, attempt_id: &str) -> Result<bool, WalletError> {
        Ok(self
            .actors
            .with(&Self::name(organization_id), |wallet| {
                wallet.inflight.remove(attempt_id)
            })
            .await)
    }

    async fn settle(
        &self,
        organization_id: &str,
        attempt_id: &str,
        cost: i128,
    ) -> Result<(), WalletError> {
        self.actors
            .with(&Self::name(organization_id), |wallet| {
                wallet.inflight.remove(attempt_id);
                wallet.balance -= cost;
            })
            .await;
        Ok(())
    }

    async fn mark_unknown_cost(
        &self,
        organization_id: &str,
        attempt_id: &str,
    ) -> Result<(), WalletError> {
        self.actors
            .with(&Self::name(organization_id), |wallet| {
                wallet.inflight.remove(attempt_id);
                wallet.unknown_cost_count = wallet.unknown_cost_count.saturating_add(1);
            })
            .await;
        Ok(())
    }

    async fn settle_unknown_cost(
        &self,
        organization_id: &str,
        cost: i128,
    ) -> Result<(), WalletError> {
        self.actors
            .with(&Self::name(organization_id), |wallet| {
                wallet.balance -= cost;
                wallet.unknown_cost_count = wallet.unknown_cost_count.saturating_sub(1);
            })
            .await;
        Ok(())
    }

    async fn add_credits(
        &self,
        organization_id: &str,
        amount: i128,
        event_id: &str,
    ) -> Result<bool, WalletError> {
        Ok(self
            .actors
            .with(&Self::name(organization_id), |wallet| {
                wallet.add_credits(amount, event_id)
            })
            .await)
    }

    async fn snapshot(&self, organization_id: &str) -> Result<WalletSnapshot, WalletError> {
        Ok(self
            .actors
            .with(&Self::name(organization_id), |wallet| wallet.snapshot())
            .await)
    }
}

/// Outcome of admission: no metering, or a reservation that must be settled or released.
#[derive(Debug)]
pub enum Admission {
    Unmetered,
    Reserved(Reservation),
}

impl Admission {
    pub fn reservation(&self) -> Option<&Reservation> {
        match self {
            Admission::Unmetered => None,
            Admission::Reserved(reservation) => Some(reservation),
        }
    }

    pub fn into_reservation(self) -> Option<Reservation> {
        match self {
            Admission::Unmetered => None,
            Admission::Reserved(reservation) => Some(reservation),
        }
    }
}

/// An in-flight attempt id held in an organization's wallet. Dropping it without settling
/// releases the id in the background.
pub struct Reservation {
    organization_id: String,
    attempt_id: String,
    wallets: Arc<dyn WalletActor>,
    tasks: BackgroundTasks,
    timeout: Duration,
    finished: bool,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("organization_id", &self.organization_id)
            .field("attempt_id", &self.attempt_id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Reservation {
    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub async fn release(mut self) {
        self.finished = true;
        release_attempt(
            self.wallets.clone(),
            &self.organization_id,
            &self.attempt_id,
            self.timeout,
        )
        .await;
    }

    /// Debits the final cost in cents, or records an unknown cost when it could not be
    /// determined. Failures are logged.
    pub async fn settle(mut self, cost_cents: Option<f64>) {
        self.finished = true;
        let call = async {
            match cost_cents {
                Some(cents) => {
                    self.wallets
                        .settle(&self.organization_id, &self.attempt_id, cents_to_scaled(cents))
                        .await
                }
                None => {
                    self.wallets
                        .mark_unknown_cost(&self.organization_id, &self.attempt_id)
                        .await
                }
            }
        };
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(
                organization_id = %self.organization_id,
                attempt_id = %self.attempt_id,
                error = %err,
                "wallet settlement failed"
            ),
            Err(_) => tracing::warn!(
                organization_id = %self.organization_id,
                attempt_id = %self.attempt_id,
                "wallet settlement timed out"
            ),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let wallets = self.wallets.clone();
        let organization_id = std::mem::take(&mut self.organization_id);
        let attempt_id = std::mem::take(&mut self.attempt_id);
        let timeout = self.timeout;
        tracing::debug!(%organization_id, %attempt_id, "reservation dropped; releasing in background");
        self.tasks.spawn("wallet_release", async move {
            release_attempt(wallets, &organization_id, &attempt_id, timeout).await;
        });
    }
}

async fn release_attempt(
    wallets: Arc<dyn WalletActor>,
    organization_id: &str,
    attempt_id: &str,
    timeout: Duration,
) {
    match tokio::time::timeout(timeout, wallets.release(organization_id, attempt_id)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            tracing::warn!(organization_id, attempt_id, error = %err, "wallet release failed")
        }
        Err(_) => tracing::warn!(organization_id, attempt_id, "wallet release timed out"),
    }
}

pub struct BillingController {
    wallets: Arc<dyn WalletActor>,
    enabled: bool,
    tasks: BackgroundTasks,
    timeout: Duration,
}

impl BillingController {
    pub fn new(
        wallets: Arc<dyn WalletActor>,
        enabled: bool,
        tasks: BackgroundTasks,
        timeout: Duration,
    ) -> Self {
        Self {
            wallets,
            enabled,
            tasks,
            timeout,
        }
    }

    pub fn wallets(&self) -> &Arc<dyn WalletActor> {
        &self.wallets
    }

    /// Reserves an in-flight slot when cloud billing applies to `organization`.
    pub async fn check_and_reserve(
        &self,
        organization: &OrganizationRecord,
    ) -> Result<Admission, BillingError> {
        if !self.enabled || !organization.cloud_billing {
            return Ok(Admission::Unmetered);
        }
        let attempt_id = generate_uuid();
        let outcome = tokio::time::timeout(
            self.timeout,
            self.wallets.reserve(&organization.id, &attempt_id),
        )
        .await
        .map_err(|_| BillingError::Timeout(self.timeout))??;

        match outcome {
            ReserveOutcome::Reserved {
                inflight,
                max_inflight,
            } => {
                tracing::debug!(
                    organization_id = %organization.id,
                    %attempt_id,
                    inflight,
                    max_inflight,
                    "billing reservation taken"
                );
                Ok(Admission::Reserved(Reservation {
                    organization_id: organization.id.clone(),
                    attempt_id,
                    wallets: self.wallets.clone(),
                    tasks: self.tasks.clone(),
                    timeout: self.timeout,
                    finished: false,
                }))
            }
            ReserveOutcome::Denied(reason) => {
                tracing::info!(organization_id = %organization.id, %reason, "billing admission denied");
                Err(BillingError::Denied(reason))
            }
        }
    }

    /// Best-effort release of an attempt id.
    pub async fn release(&self, organization_id: &str, attempt_id: &str) {
        release_attempt(self.wallets.clone(), organization_id, attempt_id, self.timeout).await;
    }

    pub async fn add_credits(
        &self,
        organization_id: &str,
        cents: f64,
        event_id: &str,
    ) -> Result<bool, BillingError> {
        let applied = tokio::time::timeout(
            self.timeout,
            self.wallets
                .add_credits(organization_id, cents_to_scaled(cents), event_id),
        )
        .await
        .map_err(|_| BillingError::Timeout(self.timeout))??;
        if applied {
            tracing::info!(organization_id, cents, event_id, "wallet credited");
        }
        Ok(applied)
    }

    pub async fn settle_unknown_cost(
        &self,
        organization_id: &str,
        cents: f64,
    ) -> Result<(), BillingError> {
        tokio::time::timeout(
            self.timeout,
            self.wallets
                .settle_unknown_cost(organization_id, cents_to_scaled(cents)),
        )
        .await
        .map_err(|_| BillingError::Timeout(self.timeout))??;
        Ok(())
    }
}
