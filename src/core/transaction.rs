//! Transaction manager: spend money only on proven success.
//!
//! Composes the budget ledger, circuit breakers, retry policy and storage
//! into one operation:
//!
//! 1. reserve the cost estimate (or take over an existing earmark)
//! 2. run the provider call under the retry policy; each attempt is gated by
//!    the provider's breaker
//! 3. persist the artifact
//! 4. commit the reservation only after persistence succeeded
//!
//! Any failure releases the reservation and rolls the record back, so cost
//! is incremented if and only if an artifact was durably saved.
//!
//! [`TransactionManager::execute_held`] stops after step 3 and hands the open
//! reservation back to the caller, so spend that only counts together with a
//! later result can be committed or released as one unit.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::budget::{BudgetError, BudgetLedger, ReservationHandle, SpendLabel, TransactionRecord};
use super::circuit::BreakerRegistry;
use super::cost::Cost;
use super::retry::{RetryError, RetryPolicy};
use super::storage::{Storage, StorageError, StoredArtifact};
use crate::ai::{GeneratedImage, ProviderError};

/// Bytes a provider result persists as.
pub trait Artifact {
    fn bytes(&self) -> &[u8];
}

impl Artifact for String {
    fn bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Artifact for GeneratedImage {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// How a transaction is paid for.
#[derive(Debug)]
pub enum Funding {
    /// Reserve this amount now.
    Reserve(Cost),
    /// Use a reservation made earlier.
    Reserved(ReservationHandle),
}

/// Failure of a transaction. The reservation is always released.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("budget exceeded for {provider}: requested {requested}, remaining {remaining}")]
    BudgetExceeded { provider: String, requested: Cost, remaining: Cost },

    #[error("circuit open for {provider}")]
    CircuitOpen { provider: String, attempts: u32 },

    #[error("{provider} failed after {attempts} attempt(s): {source}")]
    ProviderTransient {
        provider: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("{provider} rejected the request: {source}")]
    ProviderPermanent {
        provider: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("failed to persist artifact from {provider}: {source}")]
    Persistence {
        provider: String,
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("cancelled while calling {provider}")]
    Cancelled { provider: String, attempts: u32 },

    #[error("ledger error: {0}")]
    Ledger(BudgetError),
}

impl TransactionError {
    /// Stable class name recorded in manifests.
    pub fn class(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ProviderTransient { .. } => "provider_transient",
            Self::ProviderPermanent { .. } => "provider_permanent",
            Self::Persistence { .. } => "persistence",
            Self::Cancelled { .. } => "cancelled",
            Self::Ledger(_) => "ledger",
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::BudgetExceeded { provider, .. }
            | Self::CircuitOpen { provider, .. }
            | Self::ProviderTransient { provider, .. }
            | Self::ProviderPermanent { provider, .. }
            | Self::Persistence { provider, .. }
            | Self::Cancelled { provider, .. } => Some(provider),
            Self::Ledger(_) => None,
        }
    }

    /// Provider attempts made before the failure.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::CircuitOpen { attempts, .. }
            | Self::ProviderTransient { attempts, .. }
            | Self::ProviderPermanent { attempts, .. }
            | Self::Persistence { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
            Self::BudgetExceeded { .. } | Self::Ledger(_) => 0,
        }
    }

    /// Whether another provider might succeed where this one failed.
    pub fn is_routable(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::ProviderTransient { .. })
    }

    pub fn is_budget(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The storage backend itself failed, as opposed to rejecting one path.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Persistence { source: StorageError::Io { .. }, .. })
    }

    fn from_retry(provider: &str, err: RetryError) -> Self {
        let provider = provider.to_string();
        match err {
            RetryError::CircuitOpen { attempts, .. } => Self::CircuitOpen { provider, attempts },
            RetryError::Exhausted { attempts, last, .. } => {
                Self::ProviderTransient { provider, attempts, source: last }
            }
            RetryError::Permanent { attempts, error, .. } => {
                Self::ProviderPermanent { provider, attempts, source: error }
            }
            RetryError::Cancelled { attempts } => Self::Cancelled { provider, attempts },
        }
    }
}

/// Successful transaction.
#[derive(Debug)]
pub struct Committed<T> {
    pub value: T,
    pub artifact: StoredArtifact,
    pub record: TransactionRecord,
    pub attempts: u32,
}

/// Persisted result whose spend is still reserved.
#[derive(Debug)]
#[must_use = "held spend must be committed or released"]
pub struct Held<T> {
    pub value: T,
    pub artifact: StoredArtifact,
    pub attempts: u32,
    pub reservation: ReservationHandle,
}

/// Runs provider calls as budget-safe transactions.
#[derive(Clone)]
pub struct TransactionManager {
    ledger: Arc<BudgetLedger>,
    breakers: BreakerRegistry,
    retry: RetryPolicy,
    storage: Arc<dyn Storage>,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("ceiling", &self.ledger.ceiling())
            .field("committed", &self.ledger.committed())
            .field("in_flight_limit", &self.limiter.available_permits())
            .finish()
    }
}

impl TransactionManager {
    pub fn new(
        ledger: Arc<BudgetLedger>,
        breakers: BreakerRegistry,
        retry: RetryPolicy,
        storage: Arc<dyn Storage>,
        cancel: CancellationToken,
    ) -> Self {
        Self { ledger, breakers, retry, storage, limiter: Arc::new(Semaphore::new(4)), cancel }
    }

    /// Bound the number of provider calls in flight.
    pub fn with_concurrency(mut self, max_in_flight: usize) -> Self {
        self.limiter = Arc::new(Semaphore::new(max_in_flight.max(1)));
        self
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reserve money ahead of a later transaction.
    pub fn earmark(&self, amount: Cost, label: SpendLabel) -> Result<ReservationHandle, TransactionError> {
        let provider = label.provider.clone();
        self.ledger.reserve(amount, label).map_err(|err| budget_error(&provider, err))
    }

    /// Reserve several amounts as one unit; nothing is reserved on refusal.
    pub fn earmark_all(
        &self,
        spends: Vec<(Cost, SpendLabel)>,
    ) -> Result<Vec<ReservationHandle>, TransactionError> {
        let provider = spends.first().map(|(_, label)| label.provider.clone()).unwrap_or_default();
        self.ledger.reserve_all(spends).map_err(|err| budget_error(&provider, err))
    }

    /// Commit a reservation whose artifact was persisted earlier.
    pub fn settle(&self, handle: ReservationHandle) -> Result<TransactionRecord, TransactionError> {
        self.ledger.commit(handle).map_err(TransactionError::Ledger)
    }

    /// Release an earmark that will not be used.
    pub fn release(&self, handle: ReservationHandle, reason: &str) {
        self.ledger.release(handle, reason);
    }

    /// Execute one provider call as a transaction and persist its result at
    /// `path`.
    pub async fn execute<T, F, Fut>(
        &self,
        label: SpendLabel,
        funding: Funding,
        path: &str,
        call: F,
    ) -> Result<Committed<T>, TransactionError>
    where
        T: Artifact,
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let held = self.execute_held(label, funding, path, call).await?;
        let record = self.settle(held.reservation)?;
        Ok(Committed { value: held.value, artifact: held.artifact, record, attempts: held.attempts })
    }

    /// Like [`execute`](Self::execute) but leave the reservation open once the
    /// artifact is persisted. The caller settles or releases it.
    pub async fn execute_held<T, F, Fut>(
        &self,
        label: SpendLabel,
        funding: Funding,
        path: &str,
        call: F,
    ) -> Result<Held<T>, TransactionError>
    where
        T: Artifact,
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let provider = label.provider.clone();
        let handle = match funding {
            Funding::Reserve(amount) => self.earmark(amount, label)?,
            Funding::Reserved(handle) => handle,
        };

        if self.cancel.is_cancelled() {
            self.ledger.release(handle, "cancelled");
            return Err(TransactionError::Cancelled { provider, attempts: 0 });
        }

        let retried = {
            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                permit = self.limiter.acquire() => permit.ok(),
            };
            let Some(_permit) = permit else {
                self.ledger.release(handle, "cancelled");
                return Err(TransactionError::Cancelled { provider, attempts: 0 });
            };
            self.retry.run(&provider, &self.breakers, &self.cancel, call).await
        };

        let retried = match retried {
            Ok(retried) => retried,
            Err(err) => {
                let err = TransactionError::from_retry(&provider, err);
                tracing::debug!(provider = %provider, class = err.class(), error = %err, "Transaction rolled back");
                self.ledger.release(handle, err.to_string());
                return Err(err);
            }
        };

        let artifact = match self.storage.write(path, retried.value.bytes()).await {
            Ok(artifact) => artifact,
            Err(source) => {
                let err =
                    TransactionError::Persistence { provider, attempts: retried.attempts, source };
                tracing::warn!(path, error = %err, "Persistence failed, rolling back");
                self.ledger.release(handle, err.to_string());
                return Err(err);
            }
        };

        Ok(Held { value: retried.value, artifact, attempts: retried.attempts, reservation: handle })
    }
}

fn budget_error(provider: &str, err: BudgetError) -> TransactionError {
    match err {
        BudgetError::Exceeded { requested, remaining, .. } => {
            TransactionError::BudgetExceeded { provider: provider.to_string(), requested, remaining }
        }
        other => TransactionError::Ledger(other),
    }
}
