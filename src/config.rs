use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CrawlError;

pub const DEFAULT_PRIMARY_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_FALLBACK_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Budgets and time bounds of one crawl run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub max_steps: usize,
    pub max_revisits: usize,
    pub step_timeout_ms: u64,
    pub settle_timeout_ms: u64,
    pub extraction_timeout_ms: u64,
    pub failure_budget: usize,
    pub max_duration_secs: u64,
    pub history_window: usize,
    pub stale_retry_limit: usize,
    pub consecutive_transient_threshold: usize,
    pub extraction_retry_limit: usize,
    pub max_elements: usize,
    pub text_budget: usize,
    pub loop_breaking: bool,
    pub allow_offsite_navigation: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            max_revisits: 3,
            step_timeout_ms: 15_000,
            settle_timeout_ms: 5_000,
            extraction_timeout_ms: 10_000,
            failure_budget: 5,
            max_duration_secs: 600,
            history_window: 12,
            stale_retry_limit: 3,
            consecutive_transient_threshold: 3,
            extraction_retry_limit: 3,
            max_elements: 100,
            text_budget: 4_000,
            loop_breaking: true,
            allow_offsite_navigation: false,
        }
    }
}

impl CrawlConfig {
    pub fn from_env() -> Result<Self, CrawlError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `USAGI_*` keys, falling back to defaults for absent keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CrawlError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        override_from(&lookup, "USAGI_MAX_STEPS", &mut config.max_steps)?;
        override_from(&lookup, "USAGI_MAX_REVISITS", &mut config.max_revisits)?;
        override_from(&lookup, "USAGI_STEP_TIMEOUT_MS", &mut config.step_timeout_ms)?;
        override_from(&lookup, "USAGI_SETTLE_TIMEOUT_MS", &mut config.settle_timeout_ms)?;
        override_from(
            &lookup,
            "USAGI_EXTRACTION_TIMEOUT_MS",
            &mut config.extraction_timeout_ms,
        )?;
        override_from(&lookup, "USAGI_FAILURE_BUDGET", &mut config.failure_budget)?;
        override_from(&lookup, "USAGI_MAX_DURATION_SECS", &mut config.max_duration_secs)?;
        override_from(&lookup, "USAGI_HISTORY_WINDOW", &mut config.history_window)?;
        override_from(&lookup, "USAGI_STALE_RETRY_LIMIT", &mut config.stale_retry_limit)?;
        override_from(
            &lookup,
            "USAGI_TRANSIENT_THRESHOLD",
            &mut config.consecutive_transient_threshold,
        )?;
        override_from(
            &lookup,
            "USAGI_EXTRACTION_RETRY_LIMIT",
            &mut config.extraction_retry_limit,
        )?;
        override_from(&lookup, "USAGI_MAX_ELEMENTS", &mut config.max_elements)?;
        override_from(&lookup, "USAGI_TEXT_BUDGET", &mut config.text_budget)?;
        override_from(&lookup, "USAGI_LOOP_BREAKING", &mut config.loop_breaking)?;
        override_from(
            &lookup,
            "USAGI_ALLOW_OFFSITE",
            &mut config.allow_offsite_navigation,
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CrawlError> {
        let nonzero = [
            ("max_steps", self.max_steps),
            ("failure_budget", self.failure_budget),
            ("history_window", self.history_window),
            (
                "consecutive_transient_threshold",
                self.consecutive_transient_threshold,
            ),
            ("max_elements", self.max_elements),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(CrawlError::Config(format!("{name} must be greater than zero")));
        }
        if self.step_timeout_ms == 0 || self.extraction_timeout_ms == 0 {
            return Err(CrawlError::Config("timeouts must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

fn override_from<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), CrawlError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(());
        }
        *slot = raw
            .parse()
            .map_err(|_| CrawlError::Config(format!("{key}={raw} is not a valid value")))?;
    }
    Ok(())
}

/// API keys supplied out of band. Blank values count as absent.
#[derive(Clone, Default)]
pub struct Credentials {
    pub primary: Option<String>,
    pub fallback: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let clean = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            primary: clean("GOOGLE_API_KEY"),
            fallback: clean("OPENAI_API_KEY"),
        }
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("primary", &self.has_primary())
            .field("fallback", &self.has_fallback())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub primary_model: String,
    pub fallback_model: String,
    pub temperature: f32,
    pub request_timeout: Duration,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            primary_model: DEFAULT_PRIMARY_MODEL.to_string(),
            fallback_model: DEFAULT_FALLBACK_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ModelSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(model) = lookup("LLM_MODEL").filter(|v| !v.trim().is_empty()) {
            settings.primary_model = model;
        }
        if let Some(model) = lookup("FALLBACK_MODEL").filter(|v| !v.trim().is_empty()) {
            settings.fallback_model = model;
        }
        if let Some(t) = lookup("LLM_TEMPERATURE").and_then(|v| v.trim().parse().ok()) {
            settings.temperature = t;
        }
        settings
    }
}
