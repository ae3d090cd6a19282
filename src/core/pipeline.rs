//! Generation pipeline.
//!
//! Drives a session through the state machine:
//!
//! ```text
//! DISCOVERING -> GENERATING_PROMPTS -> GENERATING_IMAGES -> AWAITING_APPROVAL   (sample)
//! DISCOVERING -> PRODUCING -> GENERATING_PROMPTS -> GENERATING_IMAGES -> ...    (production)
//!             -> COMPLETED | ABORTED
//! ```
//!
//! Assets are processed in waves of `concurrency`. Every asset of a wave is
//! admitted in order by reserving its whole cost (image plus one prompt per
//! provider) in one step; the first refusal closes the wave. Admitted assets
//! then compete for a prompt and render. Prompt spend is held until the image
//! commits, so an asset is charged in full or not at all.
//! Per-asset failures are recorded and the session moves on; running out of
//! budget, an unrecoverable storage failure or cancellation stop admission,
//! let the current wave drain and end the session `ABORTED`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::approval::{ApprovalError, ApprovalGate};
use super::broadcast::{EventLevel, ProgressCounters, StatusBroadcaster, StatusEvent};
use super::budget::{BudgetLedger, ReservationHandle, SpendKind, SpendLabel};
use super::circuit::{duration_secs, BreakerRegistry, CircuitConfig};
use super::cost::Cost;
use super::manifest::{
    AssetOutcome, AssetStatus, ErrorRecord, ManifestError, ManifestStore, SessionCounters,
    SessionManifest,
};
use super::retry::{RetryConfig, RetryPolicy};
use super::session::{AbortReason, PipelineState, SessionId, SessionMode};
use super::storage::{image_path, sample_image_path, Storage};
use super::transaction::{Funding, TransactionError, TransactionManager};
use super::AssetRequest;
use crate::ai::{
    HeuristicScorer, ImageRequest, ModelOrchestrator, PromptScorer, PromptSelection,
    ProviderRegistry, RegisteredImage,
};
use crate::content::{validate_requests, AssetSource, SourceError};

/// Pipeline tuning (`[pipeline]` in the config file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Assets per wave and provider calls in flight
    pub concurrency: usize,

    /// Assets generated by a sample session
    pub sample_size: usize,

    /// Attempts per asset stage before the asset is marked failed
    pub asset_attempts: u32,

    /// How often to check for approval
    #[serde(with = "duration_secs")]
    pub approval_poll: Duration,

    /// Give up waiting for approval after this long (0 waits forever)
    #[serde(with = "duration_secs")]
    pub approval_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            sample_size: 3,
            asset_attempts: 2,
            approval_poll: Duration::from_secs(5),
            approval_timeout: Duration::ZERO,
        }
    }
}

/// Session-level failures. Per-asset failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("production requires an approval token for sample session {0}")]
    ApprovalRequired(SessionId),

    #[error("timed out waiting for approval of sample session {0}")]
    ApprovalTimeout(SessionId),

    #[error("cancelled while waiting for approval of sample session {0}")]
    Cancelled(SessionId),

    #[error("session {0} is not a sample session")]
    NotASample(SessionId),

    #[error("no enabled {0} provider")]
    NoProviders(&'static str),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),
}

/// Result of a sample, approval and production run.
#[derive(Debug, Clone)]
pub struct TwoPhaseReport {
    pub sample: SessionManifest,
    /// `None` when the sample session aborted
    pub production: Option<SessionManifest>,
}

/// Drives generation sessions.
pub struct GenerationPipeline {
    settings: PipelineSettings,
    sample_ceiling: Cost,
    production_ceiling: Cost,
    registry: ProviderRegistry,
    scorer: Arc<dyn PromptScorer>,
    retry: RetryPolicy,
    breakers: BreakerRegistry,
    storage: Arc<dyn Storage>,
    manifests: ManifestStore,
    approvals: Arc<dyn ApprovalGate>,
    broadcaster: StatusBroadcaster,
    cancel: CancellationToken,
}

impl std::fmt::Debug for GenerationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationPipeline")
            .field("settings", &self.settings)
            .field("sample_ceiling", &self.sample_ceiling)
            .field("production_ceiling", &self.production_ceiling)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl GenerationPipeline {
    pub fn new(
        registry: ProviderRegistry,
        storage: Arc<dyn Storage>,
        manifests: ManifestStore,
        approvals: Arc<dyn ApprovalGate>,
    ) -> Self {
        Self {
            settings: PipelineSettings::default(),
            sample_ceiling: Cost::from_dollars(1.0),
            production_ceiling: Cost::from_dollars(10.0),
            registry,
            scorer: Arc::new(HeuristicScorer::new()),
            retry: RetryPolicy::new(RetryConfig::default()),
            breakers: BreakerRegistry::new(CircuitConfig::default()),
            storage,
            manifests,
            approvals,
            broadcaster: StatusBroadcaster::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Independent ceilings for the sample and production ledgers.
    pub fn with_budgets(mut self, sample: Cost, production: Cost) -> Self {
        self.sample_ceiling = sample;
        self.production_ceiling = production;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Breakers are shared by every session this pipeline runs.
    pub fn with_breakers(mut self, breakers: BreakerRegistry) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn PromptScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: StatusBroadcaster) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.broadcaster
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Generate the first `sample_size` assets for review.
    ///
    /// The session ends `AWAITING_APPROVAL` unless it aborts.
    pub async fn run_sample(&self, source: &dyn AssetSource) -> Result<SessionManifest, PipelineError> {
        let requests = discover(source)?;
        self.sample_session(requests).await
    }

    /// Wait until the sample session has an approval token.
    pub async fn await_approval(&self, sample: &SessionId) -> Result<(), PipelineError> {
        let started = tokio::time::Instant::now();
        let mut announced = false;
        loop {
            if self.approvals.is_approved(sample).await? {
                tracing::info!(session = %sample, "Approval observed");
                return Ok(());
            }
            if !announced {
                tracing::info!(session = %sample, "Waiting for approval");
                announced = true;
            }
            let timeout = self.settings.approval_timeout;
            if !timeout.is_zero() && started.elapsed() >= timeout {
                return Err(PipelineError::ApprovalTimeout(sample.clone()));
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(PipelineError::Cancelled(sample.clone())),
                () = tokio::time::sleep(self.settings.approval_poll) => {}
            }
        }
    }

    /// Generate every asset, unlocked by the approval of `sample`.
    ///
    /// The approval token is consumed before any provider is called; without
    /// it the run fails with [`PipelineError::ApprovalRequired`].
    pub async fn run_production(
        &self,
        sample: &SessionId,
        source: &dyn AssetSource,
    ) -> Result<SessionManifest, PipelineError> {
        let requests = discover(source)?;
        self.unlock_production(sample).await?;
        self.run_session(SessionMode::Production, Some(sample.clone()), requests).await
    }

    /// Sample, wait for approval, then produce.
    pub async fn run_two_phase(&self, source: &dyn AssetSource) -> Result<TwoPhaseReport, PipelineError> {
        let requests = discover(source)?;
        let sample = self.sample_session(requests.clone()).await?;
        if sample.status != PipelineState::AwaitingApproval {
            tracing::warn!(session = %sample.session_id, status = %sample.status, "Sample did not finish, skipping production");
            return Ok(TwoPhaseReport { sample, production: None });
        }

        self.await_approval(&sample.session_id).await?;
        self.unlock_production(&sample.session_id).await?;
        let production = self
            .run_session(SessionMode::Production, Some(sample.session_id.clone()), requests)
            .await?;
        Ok(TwoPhaseReport { sample, production: Some(production) })
    }

    async fn sample_session(&self, mut requests: Vec<AssetRequest>) -> Result<SessionManifest, PipelineError> {
        requests.truncate(self.settings.sample_size);
        self.run_session(SessionMode::Sample, None, requests).await
    }

    async fn unlock_production(&self, sample: &SessionId) -> Result<(), PipelineError> {
        let manifest = self.manifests.load(sample).await?;
        if manifest.mode != SessionMode::Sample {
            return Err(PipelineError::NotASample(sample.clone()));
        }
        if !self.approvals.consume(sample).await? {
            tracing::warn!(session = %sample, "Production refused without approval");
            return Err(PipelineError::ApprovalRequired(sample.clone()));
        }
        Ok(())
    }

    async fn run_session(
        &self,
        mode: SessionMode,
        parent: Option<SessionId>,
        requests: Vec<AssetRequest>,
    ) -> Result<SessionManifest, PipelineError> {
        if self.registry.prompts().is_empty() {
            return Err(PipelineError::NoProviders("prompt"));
        }
        let primary_image =
            self.registry.images().first().cloned().ok_or(PipelineError::NoProviders("image"))?;

        let ceiling = match mode {
            SessionMode::Sample => self.sample_ceiling,
            SessionMode::Production => self.production_ceiling,
        };
        let ledger = Arc::new(BudgetLedger::new(ceiling));
        let transactions = TransactionManager::new(
            Arc::clone(&ledger),
            self.breakers.clone(),
            self.retry.clone(),
            Arc::clone(&self.storage),
            self.cancel.clone(),
        )
        .with_concurrency(self.settings.concurrency);
        let session = SessionContext {
            id: SessionId::generate(),
            mode,
            orchestrator: ModelOrchestrator::new(
                transactions.clone(),
                self.registry.prompts().to_vec(),
                Arc::clone(&self.scorer),
            ),
            transactions,
            images: self.registry.images().to_vec(),
        };
        let ctx = &session;
        let started_at = Utc::now();
        let mut tracker =
            Tracker::new(ctx.id.clone(), requests.len(), Arc::clone(&ledger), self.broadcaster.clone());
        let per_asset = ctx.orchestrator.cost_per_asset() + primary_image.cost;
        tracing::info!(session = %ctx.id, %mode, assets = requests.len(), ceiling = %ceiling, %per_asset, "Session started");
        tracker.emit(EventLevel::Info, format!("{mode} session started with {} asset(s)", requests.len()));

        // Idempotence: skip what earlier sessions of this mode already produced.
        let satisfied: HashSet<String> = self.manifests.committed_keys(mode).await?;
        let mut outcomes: Vec<Option<AssetOutcome>> = vec![None; requests.len()];
        let mut pending = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            if satisfied.contains(&request.key()) {
                outcomes[index] = Some(AssetOutcome::new(request, AssetStatus::AlreadySatisfied));
                tracker.finished += 1;
            } else {
                pending.push(index);
            }
        }
        if pending.len() < requests.len() {
            tracker.emit(
                EventLevel::Info,
                format!("{} asset(s) already satisfied", requests.len() - pending.len()),
            );
        }
        if mode == SessionMode::Production {
            tracker.transition(PipelineState::Producing, "Producing full asset set");
        }

        let mut stop: Option<AbortReason> = None;
        for wave in pending.chunks(self.settings.concurrency.max(1)) {
            if self.cancel.is_cancelled() {
                stop = Some(AbortReason::Cancelled);
            }
            if stop.is_some() {
                break;
            }
            if mode == SessionMode::Production && tracker.state == PipelineState::GeneratingImages {
                tracker.transition(PipelineState::Producing, "Next wave");
            }
            tracker.transition(PipelineState::GeneratingPrompts, format!("Selecting prompts for {} asset(s)", wave.len()));

            // Admission: each asset reserves its whole cost, image first, then
            // one earmark per prompt provider. The first refusal closes the wave.
            let mut admitted: Vec<(usize, Option<ReservationHandle>, Vec<ReservationHandle>)> =
                Vec::with_capacity(wave.len());
            for &index in wave {
                let request = &requests[index];
                let key = request.key();
                let image_label = SpendLabel::new(key.as_str(), primary_image.id(), SpendKind::Image);
                let mut spends = vec![(primary_image.cost, image_label)];
                spends.extend(ctx.orchestrator.spend_for(&key));
                match ctx.transactions.earmark_all(spends) {
                    Ok(handles) => {
                        let mut handles = handles.into_iter();
                        let image_earmark = handles.next();
                        admitted.push((index, image_earmark, handles.collect()));
                    }
                    Err(err) => {
                        let mut outcome = AssetOutcome::new(request, AssetStatus::Rejected);
                        outcome.errors.push(ErrorRecord::from_transaction(SpendKind::Image, &err));
                        tracker.asset_done(EventLevel::Warn, format!("{key}: rejected, {err}"));
                        outcomes[index] = Some(outcome);
                        stop.get_or_insert(AbortReason::BudgetExhausted);
                        break;
                    }
                }
            }

            let staged = join_all(
                admitted
                    .iter_mut()
                    .map(|(index, _, prompt_earmarks)| {
                        self.prompt_stage(ctx, &requests[*index], std::mem::take(prompt_earmarks))
                    }),
            )
            .await;

            let mut selected = Vec::new();
            for ((index, earmark, _), stage) in admitted.into_iter().zip(staged) {
                let request = &requests[index];
                let mut outcome = AssetOutcome::new(request, AssetStatus::Failed);
                outcome.attempts = stage.attempts;
                outcome.errors = stage.errors;
                if stage.storage_failed {
                    stop.get_or_insert(AbortReason::Persistence);
                }

                match stage.selection {
                    Some(selection) => {
                        outcome.prompt_provider = Some(selection.winner.provider.clone());
                        outcome.score = Some(selection.winner.score);
                        outcome.prompt = Some(selection.winner.prompt.clone());
                        tracker.prompts += 1;
                        selected.push((index, earmark, selection, outcome));
                    }
                    None => {
                        if let Some(earmark) = earmark {
                            ctx.transactions.release(earmark, "no prompt selected");
                        }
                        let level = if stage.cancelled {
                            outcome.status = AssetStatus::Skipped;
                            EventLevel::Warn
                        } else if stage.budget {
                            outcome.status = AssetStatus::Rejected;
                            stop.get_or_insert(AbortReason::BudgetExhausted);
                            EventLevel::Warn
                        } else {
                            EventLevel::Error
                        };
                        tracker.asset_done(level, format!("{}: no prompt ({:?})", request.key(), outcome.status));
                        outcomes[index] = Some(outcome);
                    }
                }
            }

            if selected.is_empty() {
                continue;
            }
            tracker.transition(PipelineState::GeneratingImages, format!("Rendering {} asset(s)", selected.len()));

            let rendered = join_all(selected.into_iter().map(|(index, earmark, selection, outcome)| {
                let request = &requests[index];
                async move {
                    let stage = self.image_stage(ctx, request, earmark, selection, outcome).await;
                    (index, stage)
                }
            }))
            .await;

            for (index, stage) in rendered {
                let outcome = stage.outcome;
                if stage.budget {
                    stop.get_or_insert(AbortReason::BudgetExhausted);
                }
                if stage.storage_failed {
                    stop.get_or_insert(AbortReason::Persistence);
                }
                let level = match outcome.status {
                    AssetStatus::Committed => {
                        tracker.images += 1;
                        EventLevel::Info
                    }
                    AssetStatus::Failed => EventLevel::Error,
                    _ => EventLevel::Warn,
                };
                let message = match &outcome.image_path {
                    Some(path) => format!("{}: saved {path}", outcome.key),
                    None => format!("{}: {:?}", outcome.key, outcome.status),
                };
                tracker.asset_done(level, message);
                outcomes[index] = Some(outcome);
            }
        }

        let reason = if self.cancel.is_cancelled() { Some(AbortReason::Cancelled) } else { stop };
        let assets: Vec<AssetOutcome> = outcomes
            .into_iter()
            .zip(&requests)
            .map(|(outcome, request)| {
                outcome.unwrap_or_else(|| AssetOutcome::new(request, AssetStatus::Skipped))
            })
            .collect();

        let status = match (reason, mode) {
            (Some(_), _) => PipelineState::Aborted,
            (None, SessionMode::Sample) => PipelineState::AwaitingApproval,
            (None, SessionMode::Production) => PipelineState::Completed,
        };
        let counters = SessionCounters::tally(&assets);
        let manifest = SessionManifest {
            session_id: ctx.id.clone(),
            mode,
            parent_session: parent,
            status,
            abort_reason: reason,
            ceiling,
            total_cost: ledger.committed(),
            started_at,
            finished_at: Some(Utc::now()),
            counters,
            assets,
            transactions: ledger.records(),
        };
        self.manifests.save(&manifest).await?;

        let summary = format!(
            "{} committed, {} failed, {} rejected, {} skipped, {} already satisfied; spent {} of {}",
            counters.committed,
            counters.failed,
            counters.rejected,
            counters.skipped,
            counters.already_satisfied,
            manifest.total_cost,
            ceiling
        );
        match reason {
            Some(reason) => {
                tracing::warn!(session = %ctx.id, %reason, cost = %manifest.total_cost, "Session aborted");
                tracker.finish(status, EventLevel::Warn, format!("Aborted ({reason}): {summary}"));
            }
            None => {
                tracing::info!(session = %ctx.id, cost = %manifest.total_cost, "Session finished");
                tracker.finish(status, EventLevel::Info, summary);
            }
        }
        Ok(manifest)
    }

    async fn prompt_stage(
        &self,
        ctx: &SessionContext,
        request: &AssetRequest,
        earmarks: Vec<ReservationHandle>,
    ) -> PromptStage {
        let mut stage = PromptStage::default();
        // Admission earmarks fund the first round; retries reserve afresh.
        let mut earmarks = Some(earmarks);
        for attempt in 1..=self.settings.asset_attempts.max(1) {
            stage.attempts = attempt;
            let funding = earmarks.take().unwrap_or_default();
            match ctx.orchestrator.select(ctx.id.as_str(), request, funding).await {
                Ok(selection) => {
                    stage.absorb(&selection.failures);
                    stage.selection = Some(selection);
                    return stage;
                }
                Err(err) => {
                    stage.absorb(&err.failures);
                    if err.is_cancelled() {
                        stage.cancelled = true;
                        return stage;
                    }
                    if err.is_budget() {
                        stage.budget = true;
                        return stage;
                    }
                    if stage.storage_failed || !err.failures.iter().any(TransactionError::is_routable) {
                        return stage;
                    }
                    tracing::debug!(asset = %request.key(), attempt, "Retrying prompt selection");
                }
            }
        }
        stage
    }

    /// Render one asset and settle its held prompt spend with the image, or
    /// release it when no image was committed.
    async fn image_stage(
        &self,
        ctx: &SessionContext,
        request: &AssetRequest,
        earmark: Option<ReservationHandle>,
        mut selection: PromptSelection,
        outcome: AssetOutcome,
    ) -> ImageStage {
        let mut stage = self.render(ctx, request, earmark, &selection.winner.prompt, outcome).await;
        if stage.outcome.status == AssetStatus::Committed {
            let settled: Cost = ctx.orchestrator.settle(&mut selection).iter().map(|r| r.amount).sum();
            stage.outcome.cost += settled;
        } else {
            let reason = match stage.outcome.status {
                AssetStatus::Skipped => "asset skipped",
                AssetStatus::Rejected => "asset rejected",
                _ => "asset failed",
            };
            ctx.orchestrator.abandon(&mut selection, reason);
        }
        stage
    }

    async fn render(
        &self,
        ctx: &SessionContext,
        request: &AssetRequest,
        earmark: Option<ReservationHandle>,
        prompt: &str,
        mut outcome: AssetOutcome,
    ) -> ImageStage {
        let key = request.key();
        let path = match ctx.mode {
            SessionMode::Sample => sample_image_path(ctx.id.as_str(), request),
            SessionMode::Production => image_path(request),
        };
        let image_request = ImageRequest { asset: request.clone(), prompt: prompt.to_string() };
        let mut earmark = earmark;
        let mut stage = ImageStage { outcome: AssetOutcome::new(request, AssetStatus::Failed), budget: false, storage_failed: false };

        for attempt in 1..=self.settings.asset_attempts.max(1) {
            outcome.attempts = outcome.attempts.max(attempt);
            for image in &ctx.images {
                // The earmark pays for the first call; fallbacks reserve their own price.
                let funding = earmark.take().map_or(Funding::Reserve(image.cost), Funding::Reserved);
                let label = SpendLabel::new(key.as_str(), image.id(), SpendKind::Image);
                let provider = Arc::clone(&image.provider);
                let result = ctx
                    .transactions
                    .execute(label, funding, &path, |_| {
                        let provider = Arc::clone(&provider);
                        let image_request = image_request.clone();
                        async move { provider.generate_image(&image_request).await }
                    })
                    .await;

                match result {
                    Ok(committed) => {
                        outcome.status = AssetStatus::Committed;
                        outcome.image_provider = Some(image.id().to_string());
                        outcome.image_path = Some(committed.artifact.path);
                        outcome.content_hash = Some(committed.artifact.content_hash);
                        outcome.cost += committed.record.amount;
                        stage.outcome = outcome;
                        return stage;
                    }
                    Err(err) => {
                        outcome.errors.push(ErrorRecord::from_transaction(SpendKind::Image, &err));
                        if err.is_cancelled() {
                            outcome.status = AssetStatus::Skipped;
                        } else if err.is_budget() {
                            outcome.status = AssetStatus::Rejected;
                            stage.budget = true;
                        } else if err.is_storage_failure() {
                            stage.storage_failed = true;
                        } else if err.is_routable() {
                            tracing::debug!(asset = %key, provider = image.id(), class = err.class(), "Trying next image provider");
                            continue;
                        }
                        stage.outcome = outcome;
                        return stage;
                    }
                }
            }
        }

        if let Some(earmark) = earmark {
            ctx.transactions.release(earmark, "no image provider attempted");
        }
        stage.outcome = outcome;
        stage
    }
}

fn discover(source: &dyn AssetSource) -> Result<Vec<AssetRequest>, PipelineError> {
    let requests = source.discover()?;
    validate_requests(&requests)?;
    tracing::debug!(assets = requests.len(), "Assets discovered");
    Ok(requests)
}

struct SessionContext {
    id: SessionId,
    mode: SessionMode,
    transactions: TransactionManager,
    orchestrator: ModelOrchestrator,
    images: Vec<RegisteredImage>,
}

#[derive(Default)]
struct PromptStage {
    selection: Option<PromptSelection>,
    attempts: u32,
    errors: Vec<ErrorRecord>,
    budget: bool,
    cancelled: bool,
    storage_failed: bool,
}

impl PromptStage {
    fn absorb(&mut self, failures: &[TransactionError]) {
        self.storage_failed |= failures.iter().any(TransactionError::is_storage_failure);
        self.errors.extend(failures.iter().map(|err| ErrorRecord::from_transaction(SpendKind::Prompt, err)));
    }
}

struct ImageStage {
    outcome: AssetOutcome,
    budget: bool,
    storage_failed: bool,
}

/// State machine position plus running counters for events.
struct Tracker {
    session: SessionId,
    state: PipelineState,
    total: usize,
    finished: usize,
    prompts: usize,
    images: usize,
    ledger: Arc<BudgetLedger>,
    broadcaster: StatusBroadcaster,
}

impl Tracker {
    fn new(session: SessionId, total: usize, ledger: Arc<BudgetLedger>, broadcaster: StatusBroadcaster) -> Self {
        Self {
            session,
            state: PipelineState::Discovering,
            total,
            finished: 0,
            prompts: 0,
            images: 0,
            ledger,
            broadcaster,
        }
    }

    fn transition(&mut self, next: PipelineState, message: impl Into<String>) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(session = %self.session, from = %self.state, to = %next, "Unexpected state transition");
        }
        tracing::debug!(session = %self.session, from = %self.state, to = %next, "State transition");
        self.state = next;
        self.emit(EventLevel::Info, message);
    }

    fn asset_done(&mut self, level: EventLevel, message: String) {
        self.finished += 1;
        self.emit(level, message);
    }

    fn finish(&mut self, status: PipelineState, level: EventLevel, message: String) {
        self.state = status;
        self.emit(level, message);
    }

    fn emit(&self, level: EventLevel, message: impl Into<String>) {
        let progress = if self.total == 0 { 1.0 } else { self.finished as f64 / self.total as f64 };
        self.broadcaster.publish(StatusEvent {
            session_id: self.session.clone(),
            phase: self.state,
            level,
            progress,
            counters: ProgressCounters {
                prompts: self.prompts,
                images: self.images,
                cost: self.ledger.committed(),
            },
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{MockImageProvider, MockPromptProvider, ProviderError, RegisteredPrompt, ScriptedOutcome};
    use crate::core::{AssetCategory, MemoryApprovalGate, MemoryStorage};
    use tempfile::TempDir;

    fn dollars(d: f64) -> Cost {
        Cost::from_dollars(d)
    }

    fn assets(n: usize) -> Vec<AssetRequest> {
        (0..n).map(|i| AssetRequest::new(AssetCategory::Icon, format!("asset-{i:02}"))).collect()
    }

    struct Harness {
        _temp: TempDir,
        pipeline: GenerationPipeline,
        storage: Arc<MemoryStorage>,
        prompt: MockPromptProvider,
        image: MockImageProvider,
        approvals: Arc<MemoryApprovalGate>,
    }

    fn harness(prompt: MockPromptProvider, image: MockImageProvider) -> Harness {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let approvals = Arc::new(MemoryApprovalGate::new());
        let registry = ProviderRegistry::new()
            .with_prompt(RegisteredPrompt::new(Arc::new(prompt.clone()), dollars(0.04)))
            .with_image(RegisteredImage::new(Arc::new(image.clone()), dollars(0.04)));
        let pipeline = GenerationPipeline::new(
            registry,
            storage.clone(),
            ManifestStore::new(temp.path()),
            approvals.clone(),
        )
        .with_retry(RetryPolicy::new(RetryConfig { jitter: false, base_delay: Duration::from_millis(1), ..RetryConfig::default() }))
        .with_budgets(dollars(1.0), dollars(1.0));
        Harness { _temp: temp, pipeline, storage, prompt, image, approvals }
    }

    #[tokio::test]
    async fn test_sample_session_awaits_approval() {
        let h = harness(MockPromptProvider::new("writer"), MockImageProvider::new("painter"));
        let manifest = h.pipeline.run_sample(&assets(5)).await.unwrap();

        assert_eq!(manifest.mode, SessionMode::Sample);
        assert_eq!(manifest.status, PipelineState::AwaitingApproval);
        assert_eq!(manifest.assets.len(), 3);
        assert_eq!(manifest.counters.committed, 3);
        assert_eq!(manifest.total_cost, dollars(0.24));
        let image = format!("samples/{}/icon/asset-00.png", manifest.session_id);
        assert!(h.storage.contains(&image));
    }

    #[tokio::test]
    async fn test_permanent_image_failure_marks_asset_failed_and_continues() {
        let image = MockImageProvider::new("painter")
            .with_script([ScriptedOutcome::Fail(ProviderError::InvalidRequest("content policy".into()))]);
        let h = harness(MockPromptProvider::new("writer"), image);
        let manifest = h
            .pipeline
            .with_settings(PipelineSettings { concurrency: 1, ..PipelineSettings::default() })
            .run_sample(&assets(3))
            .await
            .unwrap();

        assert_eq!(manifest.status, PipelineState::AwaitingApproval);
        assert_eq!(manifest.counters.failed, 1);
        assert_eq!(manifest.counters.committed, 2);
        let failed = &manifest.assets[0];
        assert_eq!(failed.errors[0].class, "provider_permanent");
        // Nothing is charged for an asset without an image.
        assert_eq!(failed.cost, Cost::ZERO);
        assert_eq!(manifest.total_cost, dollars(0.16));
        assert!(manifest
            .transactions
            .iter()
            .any(|t| t.asset == "icon/asset-00"
                && t.kind == SpendKind::Prompt
                && t.reason.as_deref() == Some("asset failed")));
    }

    #[tokio::test]
    async fn test_production_requires_sample_manifest_and_token() {
        let h = harness(MockPromptProvider::new("writer"), MockImageProvider::new("painter"));
        let sample = h.pipeline.run_sample(&assets(2)).await.unwrap();
        let calls_after_sample = h.image.calls();

        let err = h.pipeline.run_production(&sample.session_id, &assets(4)).await.unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalRequired(_)));
        assert_eq!(h.image.calls(), calls_after_sample);

        h.approvals.approve(&sample.session_id).await.unwrap();
        let production = h.pipeline.run_production(&sample.session_id, &assets(4)).await.unwrap();
        assert_eq!(production.status, PipelineState::Completed);
        assert_eq!(production.parent_session.as_ref(), Some(&sample.session_id));
        assert_eq!(production.counters.committed, 4);
        assert!(h.storage.contains("icon/asset-03.png"));

        // The token is single use.
        let again = h.pipeline.run_production(&sample.session_id, &assets(4)).await.unwrap_err();
        assert!(matches!(again, PipelineError::ApprovalRequired(_)));
    }

    #[tokio::test]
    async fn test_events_follow_state_machine() {
        let h = harness(MockPromptProvider::new("writer"), MockImageProvider::new("painter"));
        let mut rx = h.pipeline.broadcaster().receiver();
        h.pipeline.run_sample(&assets(2)).await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if phases.last() != Some(&event.phase) {
                phases.push(event.phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                PipelineState::Discovering,
                PipelineState::GeneratingPrompts,
                PipelineState::GeneratingImages,
                PipelineState::AwaitingApproval
            ]
        );
        let last = h.pipeline.broadcaster().latest().unwrap();
        assert!((last.progress - 1.0).abs() < f64::EPSILON);
        assert_eq!(last.counters.images, 2);
        assert_eq!(h.prompt.calls(), 2);
    }

    #[tokio::test]
    async fn test_settings_from_toml() {
        let settings: PipelineSettings = toml::from_str("concurrency = 8\napproval_poll = 0.5").unwrap();
        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.approval_poll, Duration::from_millis(500));
        assert_eq!(settings.sample_size, 3);
    }
}
