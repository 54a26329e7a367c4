//! Reasoning providers: turn a page state, goal and history into the next action.

pub mod gemini;
pub mod openai;
pub mod parse;
pub mod prompt;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{Credentials, CrawlConfig, ModelSettings};
use crate::error::{CrawlError, ReasoningError};
use crate::history::History;
use crate::types::{Action, PageState};
use crate::visited::VisitRecord;

pub use gemini::GeminiClient;
pub use openai::OpenAiClient;
pub use prompt::Prompt;

/// Everything a provider may look at when choosing the next action.
#[derive(Clone, Copy)]
pub struct PlanRequest<'a> {
    pub state: &'a PageState,
    pub goal: &'a str,
    pub history: &'a History,
    pub visit: Option<&'a VisitRecord>,
    pub config: &'a CrawlConfig,
}

#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Propose one action valid against `request.state`, or a classified error.
    async fn propose(&self, request: PlanRequest<'_>) -> Result<Action, ReasoningError>;
}

/// A hosted model endpoint: one structured prompt in, raw text out.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &Prompt) -> Result<String, ReasoningError>;
}

/// Classify a non-success HTTP response from a model endpoint.
pub fn classify_http_error(provider: &str, status: u16, body: &str) -> ReasoningError {
    let lowered = body.to_ascii_lowercase();
    let snippet: String = body.chars().take(300).collect();
    let message = format!("HTTP {status}: {snippet}");
    match status {
        401 | 403 => ReasoningError::permanent(provider, format!("invalid credential ({message})")),
        429 if lowered.contains("quota") => {
            ReasoningError::permanent(provider, format!("quota exhausted ({message})"))
        }
        400 | 404 | 422 => ReasoningError::permanent(provider, message),
        _ => ReasoningError::transient(provider, message),
    }
}

/// The single provider implementation: prompt, parse, validate, re-prompt once.
pub struct ModelProvider<C> {
    client: C,
}

impl<C: ModelClient> ModelProvider<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: ModelClient> ReasoningProvider for ModelProvider<C> {
    fn name(&self) -> &str {
        self.client.name()
    }

    async fn propose(&self, request: PlanRequest<'_>) -> Result<Action, ReasoningError> {
        let prompt = prompt::build(&request, None);
        let raw = self.client.complete(&prompt).await?;
        let problem = match parse::parse_action(&raw, request.state, request.config) {
            Ok(action) => return Ok(action),
            Err(problem) => problem,
        };

        warn!(
            provider = self.client.name(),
            problem = %problem,
            "Model response rejected, re-prompting with a correction"
        );
        let correction = problem.correction_note();
        let prompt = prompt::build(&request, Some(&correction));
        let raw = self.client.complete(&prompt).await?;
        parse::parse_action(&raw, request.state, request.config).map_err(|problem| {
            ReasoningError::transient(
                self.client.name(),
                format!("invalid action after correction: {problem}"),
            )
        })
    }
}

/// Outcome of a failed [`Brain::propose`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Recorded and re-planned; the brain may already have switched providers.
    Retry(ReasoningError),
    /// No provider left to ask.
    Exhausted(ReasoningError),
}

/// Provider selection and the downgrade policy.
///
/// The active provider is fixed at startup. It is replaced by the standby exactly once,
/// after a permanent error or a run of consecutive transient errors.
pub struct Brain {
    active: Box<dyn ReasoningProvider>,
    standby: Option<Box<dyn ReasoningProvider>>,
    transient_threshold: usize,
    consecutive_transient: usize,
    switched: bool,
    propose_timeout: Duration,
}

const DEFAULT_PROPOSE_TIMEOUT: Duration = Duration::from_secs(120);

impl Brain {
    pub fn new(
        active: Box<dyn ReasoningProvider>,
        standby: Option<Box<dyn ReasoningProvider>>,
        transient_threshold: usize,
    ) -> Self {
        Self {
            active,
            standby,
            transient_threshold: transient_threshold.max(1),
            consecutive_transient: 0,
            switched: false,
            propose_timeout: DEFAULT_PROPOSE_TIMEOUT,
        }
    }

    /// Upper bound for one proposal, re-prompt included.
    pub fn with_propose_timeout(mut self, limit: Duration) -> Self {
        self.propose_timeout = limit;
        self
    }

    /// Gemini when its key is present, otherwise the OpenAI-compatible fallback.
    pub fn from_credentials(
        credentials: &Credentials,
        models: &ModelSettings,
        config: &CrawlConfig,
    ) -> Result<Self, CrawlError> {
        let primary = credentials.primary.as_deref().map(|key| {
            Box::new(ModelProvider::new(GeminiClient::new(key, None, models)))
                as Box<dyn ReasoningProvider>
        });
        let fallback = credentials.fallback.as_deref().map(|key| {
            Box::new(ModelProvider::new(OpenAiClient::new(key, None, models)))
                as Box<dyn ReasoningProvider>
        });

        let (active, standby) = match (primary, fallback) {
            (Some(p), f) => (p, f),
            (None, Some(f)) => (f, None),
            (None, None) => return Err(CrawlError::NoCredentials),
        };
        info!(
            provider = active.name(),
            standby = standby.as_ref().map(|s| s.name()).unwrap_or("none"),
            "Reasoning provider selected"
        );
        Ok(
            Self::new(active, standby, config.consecutive_transient_threshold)
                .with_propose_timeout(models.request_timeout * 2),
        )
    }

    pub fn active_name(&self) -> &str {
        self.active.name()
    }

    pub fn has_switched(&self) -> bool {
        self.switched
    }

    pub async fn propose(&mut self, request: PlanRequest<'_>) -> Result<Action, PlanError> {
        let err = match timeout(self.propose_timeout, self.active.propose(request)).await {
            Ok(Ok(action)) => {
                self.consecutive_transient = 0;
                return Ok(action);
            }
            Ok(Err(err)) => err,
            Err(_) => ReasoningError::transient(
                self.active.name(),
                format!("no proposal within {}s", self.propose_timeout.as_secs()),
            ),
        };

        if err.is_transient() {
            self.consecutive_transient += 1;
            if self.consecutive_transient < self.transient_threshold {
                return Err(PlanError::Retry(err));
            }
            warn!(
                provider = self.active.name(),
                failures = self.consecutive_transient,
                "Consecutive transient failures reached threshold"
            );
        }

        if self.switch_to_standby() {
            Err(PlanError::Retry(err))
        } else {
            Err(PlanError::Exhausted(err))
        }
    }

    fn switch_to_standby(&mut self) -> bool {
        let Some(standby) = self.standby.take() else {
            return false;
        };
        let previous = std::mem::replace(&mut self.active, standby);
        info!(
            from = previous.name(),
            to = self.active.name(),
            "Switching reasoning provider for the rest of the run"
        );
        self.consecutive_transient = 0;
        self.switched = true;
        true
    }
}
