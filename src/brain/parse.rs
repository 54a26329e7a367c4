//! Parsing raw model output into an [`Action`] that is valid for the current page.

use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::CrawlConfig;
use crate::types::{Action, ElementKind, PageState};

/// Why a model response could not be used.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseProblem {
    #[error("response is empty")]
    Empty,

    #[error("response is not a JSON action: {0}")]
    Malformed(String),

    #[error("response references several elements at once")]
    Ambiguous,

    #[error("element {0} does not exist on the current page")]
    UnknownElement(String),

    #[error("element {0} is disabled")]
    Disabled(String),

    #[error("element {0} cannot be typed into")]
    NotFillable(String),

    #[error("url {0} is not a navigable http(s) address")]
    InvalidUrl(String),

    #[error("url {0} leaves the site being explored")]
    Offsite(String),
}

impl ParseProblem {
    /// Note appended to the re-prompt.
    pub fn correction_note(&self) -> String {
        let hint = match self {
            ParseProblem::Empty | ParseProblem::Malformed(_) => {
                "Reply with exactly one JSON object such as {\"action\":\"click\",\"element_id\":\"e0\"}."
            }
            ParseProblem::Ambiguous => "Pick exactly one element id.",
            ParseProblem::UnknownElement(_) | ParseProblem::Disabled(_) => {
                "Use one of the enabled element ids listed for the current page."
            }
            ParseProblem::NotFillable(_) => "Only type into elements listed as fillable.",
            ParseProblem::InvalidUrl(_) | ParseProblem::Offsite(_) => {
                "Navigate only to http(s) pages of the current site."
            }
        };
        format!("Your previous reply was rejected: {self}. {hint}")
    }
}

fn strip_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// The outermost `{...}` or `[...]` span, whichever opens first.
fn embedded_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn to_value(raw: &str) -> Result<Value, ParseProblem> {
    let cleaned = strip_fences(raw);
    if cleaned.is_empty() {
        return Err(ParseProblem::Empty);
    }
    match serde_json::from_str(cleaned) {
        Ok(value) => Ok(value),
        Err(first) => embedded_json(cleaned)
            .and_then(|span| serde_json::from_str(span).ok())
            .ok_or_else(|| ParseProblem::Malformed(first.to_string())),
    }
}

pub fn parse_action(
    raw: &str,
    state: &PageState,
    config: &CrawlConfig,
) -> Result<Action, ParseProblem> {
    let value = match to_value(raw)? {
        Value::Array(items) => items.into_iter().next().ok_or(ParseProblem::Empty)?,
        other => other,
    };
    let Value::Object(map) = &value else {
        return Err(ParseProblem::Malformed("expected a JSON object".into()));
    };
    let multi_target = ["element_id", "target_id"]
        .iter()
        .any(|key| matches!(map.get(*key), Some(Value::Array(_))));
    if multi_target {
        return Err(ParseProblem::Ambiguous);
    }

    let action: Action =
        serde_json::from_value(value).map_err(|e| ParseProblem::Malformed(e.to_string()))?;
    validate(action, state, config)
}

/// Check `action` against the page it will be executed on.
pub fn validate(
    action: Action,
    state: &PageState,
    config: &CrawlConfig,
) -> Result<Action, ParseProblem> {
    match action {
        Action::Click { ref element_id } => {
            let element = state
                .element(element_id)
                .ok_or_else(|| ParseProblem::UnknownElement(element_id.clone()))?;
            if !element.enabled {
                return Err(ParseProblem::Disabled(element_id.clone()));
            }
            Ok(action)
        }
        Action::Type { ref element_id, .. } => {
            let element = state
                .element(element_id)
                .ok_or_else(|| ParseProblem::UnknownElement(element_id.clone()))?;
            if !element.enabled {
                return Err(ParseProblem::Disabled(element_id.clone()));
            }
            if element.kind != ElementKind::Fillable {
                return Err(ParseProblem::NotFillable(element_id.clone()));
            }
            Ok(action)
        }
        Action::Navigate { url } => {
            let resolved = resolve_navigation(&url, state, config)?;
            Ok(Action::Navigate { url: resolved })
        }
        Action::Wait { duration_ms } => Ok(Action::Wait {
            duration_ms: duration_ms.min(config.step_timeout_ms / 2),
        }),
        Action::Scroll { .. } | Action::Finish { .. } => Ok(action),
    }
}

fn resolve_navigation(
    raw: &str,
    state: &PageState,
    config: &CrawlConfig,
) -> Result<String, ParseProblem> {
    let invalid = || ParseProblem::InvalidUrl(raw.to_string());
    let target = match Url::parse(&state.url) {
        Ok(base) => base.join(raw.trim()).map_err(|_| invalid())?,
        Err(_) => Url::parse(raw.trim()).map_err(|_| invalid())?,
    };
    if !matches!(target.scheme(), "http" | "https") {
        return Err(invalid());
    }
    let target_str = target.to_string();
    if config.allow_offsite_navigation {
        return Ok(target_str);
    }

    let same_origin = Url::parse(&state.url)
        .map(|current| current.origin() == target.origin())
        .unwrap_or(false);
    let linked = state
        .elements
        .iter()
        .filter_map(|e| e.href.as_deref())
        .any(|href| href == target_str || href == raw);
    if same_origin || linked {
        Ok(target_str)
    } else {
        Err(ParseProblem::Offsite(target_str))
    }
}
