//! Mock providers for testing and dry runs.
//!
//! Produce deterministic prompts and placeholder image bytes without any
//! network calls. A script of outcomes can be queued to simulate failures,
//! latency and mid-run cancellation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{GeneratedImage, ImageProvider, ImageRequest, PromptProvider, PromptRequest, ProviderError};

/// What the next call does.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Return the default output.
    Succeed,
    /// Return this prompt text (ignored by image mocks).
    Respond(String),
    /// Wait, then return the default output.
    Delay(Duration),
    /// Fail with this error.
    Fail(ProviderError),
    /// Never return.
    Hang,
}

#[derive(Debug, Default)]
struct Script {
    queue: Mutex<VecDeque<ScriptedOutcome>>,
    fallback: Mutex<Option<ScriptedOutcome>>,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancel_on: Mutex<Option<(u32, CancellationToken)>>,
}

/// Decrements the in-flight gauge when a call finishes or is dropped.
struct InFlight<'a>(&'a Script);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Script {
    fn push(&self, outcome: ScriptedOutcome) {
        self.queue.lock().push_back(outcome);
    }

    /// Run the scripted behavior for one call. `None` means use the default.
    async fn play(&self) -> Result<Option<String>, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self);

        let trigger = self.cancel_on.lock().as_ref().filter(|(n, _)| *n == call).map(|(_, t)| t.clone());
        if let Some(token) = trigger {
            tracing::debug!(call, "Mock provider cancelling the session");
            token.cancel();
            std::future::pending::<()>().await;
        }

        let outcome = self
            .queue
            .lock()
            .pop_front()
            .or_else(|| self.fallback.lock().clone())
            .unwrap_or(ScriptedOutcome::Succeed);

        match outcome {
            ScriptedOutcome::Succeed => Ok(None),
            ScriptedOutcome::Respond(text) => Ok(Some(text)),
            ScriptedOutcome::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(None)
            }
            ScriptedOutcome::Fail(err) => Err(err),
            ScriptedOutcome::Hang => {
                std::future::pending::<()>().await;
                Ok(None)
            }
        }
    }
}

macro_rules! scripted_builders {
    () => {
        /// Queue outcomes for the next calls, in order.
        pub fn with_script(self, outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
            for outcome in outcomes {
                self.script.push(outcome);
            }
            self
        }

        /// Outcome used once the queue is empty.
        pub fn otherwise(self, outcome: ScriptedOutcome) -> Self {
            *self.script.fallback.lock() = Some(outcome);
            self
        }

        /// Fail every call with `error`.
        pub fn always_failing(self, error: ProviderError) -> Self {
            self.otherwise(ScriptedOutcome::Fail(error))
        }

        /// Cancel `token` when call number `call` starts, then never return.
        pub fn cancel_on_call(self, call: u32, token: CancellationToken) -> Self {
            *self.script.cancel_on.lock() = Some((call, token));
            self
        }

        /// Calls received so far.
        pub fn calls(&self) -> u32 {
            self.script.calls.load(Ordering::SeqCst)
        }

        /// Highest number of overlapping calls observed.
        pub fn max_in_flight(&self) -> usize {
            self.script.max_in_flight.load(Ordering::SeqCst)
        }
    };
}

/// Prompt provider returning deterministic text.
#[derive(Debug, Clone)]
pub struct MockPromptProvider {
    id: String,
    style: String,
    script: Arc<Script>,
}

impl MockPromptProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), style: "clean flat".to_string(), script: Arc::default() }
    }

    /// Style words placed at the front of every generated prompt.
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }

    scripted_builders!();

    fn default_prompt(&self, request: &PromptRequest) -> String {
        let asset = &request.asset;
        let mut prompt = format!(
            "{} {} of {}, centered composition, soft studio lighting, cohesive palette",
            self.style,
            asset.category,
            asset.name.replace(['-', '_'], " ")
        );
        if !asset.context.is_empty() {
            prompt.push_str(", ");
            prompt.push_str(asset.context.trim());
        }
        prompt
    }
}

#[async_trait]
impl PromptProvider for MockPromptProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate_prompt(&self, request: &PromptRequest) -> Result<String, ProviderError> {
        let scripted = self.script.play().await?;
        Ok(scripted.unwrap_or_else(|| self.default_prompt(request)))
    }
}

/// Image provider returning placeholder bytes.
#[derive(Debug, Clone)]
pub struct MockImageProvider {
    id: String,
    script: Arc<Script>,
}

/// PNG file signature; enough for file-type sniffing in tests.
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

impl MockImageProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), script: Arc::default() }
    }

    scripted_builders!();
}

#[async_trait]
impl ImageProvider for MockImageProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedImage, ProviderError> {
        self.script.play().await?;

        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(&request.asset.width.to_be_bytes());
        bytes.extend_from_slice(&request.asset.height.to_be_bytes());
        bytes.extend_from_slice(request.prompt.as_bytes());
        Ok(GeneratedImage { bytes, remote_id: Some(format!("{}-{}", self.id, self.calls())) })
    }
}
