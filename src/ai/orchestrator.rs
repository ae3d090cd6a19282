//! Multi-provider prompt competition.
//!
//! For one asset every prompt provider is asked concurrently, each call as its
//! own budget transaction. Returned prompts are scored and the best one wins;
//! equal scores go to the provider with the better priority.
//!
//! Prompt spend is persisted but held: it is settled once the asset's image is
//! committed, or abandoned when the asset ends without one.

use std::sync::Arc;

use futures::future::join_all;

use super::{PromptRequest, PromptScorer, RegisteredPrompt};
use crate::core::storage::prompt_path;
use crate::core::{
    AssetRequest, Cost, Funding, ReservationHandle, SpendKind, SpendLabel, TransactionError,
    TransactionManager, TransactionRecord,
};

/// One successful prompt, persisted and funded.
#[derive(Debug, Clone)]
pub struct PromptCandidate {
    pub provider: String,
    pub priority: u32,
    pub prompt: String,
    pub score: f64,
    pub cost: Cost,
    pub attempts: u32,
    /// Where the prompt text was persisted
    pub path: String,
}

/// Outcome of a competition with at least one successful provider.
#[derive(Debug)]
pub struct PromptSelection {
    pub winner: PromptCandidate,
    /// Every successful candidate, winner included, in priority order
    pub candidates: Vec<PromptCandidate>,
    /// Providers that produced nothing
    pub failures: Vec<TransactionError>,
    /// Open reservations for every candidate, settled with the asset
    pub reservations: Vec<ReservationHandle>,
}

impl PromptSelection {
    /// Prompt spend held for this asset.
    pub fn cost(&self) -> Cost {
        self.candidates.iter().map(|c| c.cost).sum()
    }
}

/// Every provider failed for an asset.
#[derive(Debug, thiserror::Error)]
#[error("all {} prompt provider(s) failed for {asset}", failures.len())]
pub struct PromptSelectionError {
    pub asset: String,
    pub failures: Vec<TransactionError>,
}

impl PromptSelectionError {
    /// No provider call could be funded.
    pub fn is_budget(&self) -> bool {
        !self.failures.is_empty() && self.failures.iter().all(TransactionError::is_budget)
    }

    pub fn is_cancelled(&self) -> bool {
        self.failures.iter().any(TransactionError::is_cancelled)
    }
}

/// Runs prompt competitions through the transaction manager.
#[derive(Clone)]
pub struct ModelOrchestrator {
    transactions: TransactionManager,
    providers: Vec<RegisteredPrompt>,
    scorer: Arc<dyn PromptScorer>,
}

impl std::fmt::Debug for ModelOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelOrchestrator")
            .field("providers", &self.providers.iter().map(RegisteredPrompt::id).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ModelOrchestrator {
    pub fn new(
        transactions: TransactionManager,
        mut providers: Vec<RegisteredPrompt>,
        scorer: Arc<dyn PromptScorer>,
    ) -> Self {
        providers.sort_by_key(|p| p.priority);
        Self { transactions, providers, scorer }
    }

    pub fn providers(&self) -> &[RegisteredPrompt] {
        &self.providers
    }

    /// Prompt spend one asset needs if every provider is funded.
    pub fn cost_per_asset(&self) -> Cost {
        self.providers.iter().map(|p| p.cost).sum()
    }

    /// Labelled prompt spend for one asset, in provider priority order.
    pub fn spend_for(&self, key: &str) -> Vec<(Cost, SpendLabel)> {
        self.providers
            .iter()
            .map(|p| (p.cost, SpendLabel::new(key, p.id(), SpendKind::Prompt)))
            .collect()
    }

    /// Ask every provider for a prompt and pick the best.
    ///
    /// `earmarks` fund the providers in priority order; a provider without one
    /// reserves its own cost.
    pub async fn select(
        &self,
        session: &str,
        asset: &AssetRequest,
        earmarks: Vec<ReservationHandle>,
    ) -> Result<PromptSelection, PromptSelectionError> {
        let key = asset.key();
        let mut earmarks = earmarks.into_iter();
        let funded: Vec<_> = self
            .providers
            .iter()
            .map(|entry| (entry, earmarks.next().map_or(Funding::Reserve(entry.cost), Funding::Reserved)))
            .collect();
        for unused in earmarks {
            self.transactions.release(unused, "no matching prompt provider");
        }

        let calls = funded.into_iter().map(|(entry, funding)| self.compete(session, asset, &key, entry, funding));
        let results = join_all(calls).await;

        let mut candidates = Vec::new();
        let mut reservations = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok((candidate, reservation)) => {
                    candidates.push(candidate);
                    reservations.push(reservation);
                }
                Err(err) => {
                    tracing::debug!(asset = %key, provider = ?err.provider(), class = err.class(), "Prompt candidate failed");
                    failures.push(err);
                }
            }
        }

        // Candidates are in priority order, so a strict comparison keeps the
        // better-priority provider on equal scores.
        let mut best: Option<&PromptCandidate> = None;
        for candidate in &candidates {
            if best.map_or(true, |b| candidate.score > b.score) {
                best = Some(candidate);
            }
        }

        match best.cloned() {
            Some(winner) => {
                tracing::debug!(
                    asset = %key,
                    provider = %winner.provider,
                    score = winner.score,
                    competitors = candidates.len(),
                    "Prompt selected"
                );
                Ok(PromptSelection { winner, candidates, failures, reservations })
            }
            None => Err(PromptSelectionError { asset: key, failures }),
        }
    }

    /// Commit the prompt spend held by `selection`.
    pub fn settle(&self, selection: &mut PromptSelection) -> Vec<TransactionRecord> {
        std::mem::take(&mut selection.reservations)
            .into_iter()
            .filter_map(|handle| match self.transactions.settle(handle) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::error!(provider = %selection.winner.provider, error = %err, "Held prompt spend could not be committed");
                    None
                }
            })
            .collect()
    }

    /// Release the prompt spend held by `selection`.
    pub fn abandon(&self, selection: &mut PromptSelection, reason: &str) {
        for handle in std::mem::take(&mut selection.reservations) {
            self.transactions.release(handle, reason);
        }
    }

    async fn compete(
        &self,
        session: &str,
        asset: &AssetRequest,
        key: &str,
        entry: &RegisteredPrompt,
        funding: Funding,
    ) -> Result<(PromptCandidate, ReservationHandle), TransactionError> {
        let provider_id = entry.id().to_string();
        let request = PromptRequest {
            asset: asset.clone(),
            persona: entry.persona.clone(),
            temperature: entry.temperature,
        };
        let path = prompt_path(session, asset, &provider_id);
        let label = SpendLabel::new(key, provider_id.as_str(), SpendKind::Prompt);

        let provider = Arc::clone(&entry.provider);
        let held = self
            .transactions
            .execute_held(label, funding, &path, |_| {
                let provider = Arc::clone(&provider);
                let request = request.clone();
                async move { provider.generate_prompt(&request).await }
            })
            .await?;

        let candidate = PromptCandidate {
            score: self.scorer.score(asset, &held.value),
            provider: provider_id,
            priority: entry.priority,
            prompt: held.value,
            cost: held.reservation.amount(),
            attempts: held.attempts,
            path: held.artifact.path,
        };
        Ok((candidate, held.reservation))
    }
}
