use std::collections::HashSet;
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::config::CrawlConfig;
use crate::error::{ExtractionError, SessionError};
use crate::session::{BrowserSession, PageInfo, RawElement, RawSnapshot};
use crate::types::{ELEMENT_TEXT_MAX_CHARS, ElementRef, PageState};

/// Produces [`PageState`]s from a live session within a hard time bound.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    extraction_timeout: Duration,
    settle_timeout: Duration,
    max_elements: usize,
    text_budget: usize,
}

impl Snapshotter {
    pub fn new(config: &CrawlConfig) -> Self {
        Self {
            extraction_timeout: config.extraction_timeout(),
            settle_timeout: config.settle_timeout(),
            max_elements: config.max_elements,
            text_budget: config.text_budget,
        }
    }

    /// Read the current page.
    ///
    /// Fails only when the location itself cannot be read. A page that never settles,
    /// or whose element query runs out of time, yields a state tagged `partial`.
    pub async fn snapshot(&self, session: &dyn BrowserSession) -> Result<PageState, ExtractionError> {
        let deadline = Instant::now() + self.extraction_timeout;
        let budget_ms = self.extraction_timeout.as_millis() as u64;

        let info = match timeout(self.extraction_timeout, session.location()).await {
            Err(_) => return Err(ExtractionError::Timeout(budget_ms)),
            Ok(Err(SessionError::Detached)) => return Err(ExtractionError::Detached),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(info)) => info,
        };

        let mut partial = false;
        let settle_for = self.settle_timeout.min(remaining(deadline));
        match timeout(settle_for, session.wait_settled(settle_for)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, url = %info.url, "Page did not settle, extracting anyway");
                partial = true;
            }
            Err(_) => partial = true,
        }

        let raw = match timeout(remaining(deadline), session.query_elements()).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(SessionError::Detached)) => return Err(ExtractionError::Detached),
            Ok(Err(e)) => {
                warn!(error = %e, url = %info.url, "Element query failed, returning partial state");
                partial = true;
                RawSnapshot::default()
            }
            Err(_) => {
                warn!(url = %info.url, budget_ms, "Element query timed out, returning partial state");
                partial = true;
                RawSnapshot::default()
            }
        };

        Ok(self.normalize(info, raw, partial))
    }

    /// Turn a raw page report into a `PageState`: collapse whitespace, bound sizes and
    /// keep the first element of any duplicated id.
    pub fn normalize(&self, info: PageInfo, raw: RawSnapshot, partial: bool) -> PageState {
        let mut seen = HashSet::new();
        let elements: Vec<ElementRef> = raw
            .elements
            .into_iter()
            .filter(|e| !e.id.is_empty() && seen.insert(e.id.clone()))
            .take(self.max_elements)
            .map(normalize_element)
            .collect();

        let text = condense(&raw.text, self.text_budget);

        PageState {
            url: info.url,
            title: collapse_whitespace(&info.title),
            elements,
            text: if text.is_empty() { None } else { Some(text) },
            partial,
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn normalize_element(raw: RawElement) -> ElementRef {
    ElementRef {
        id: raw.id,
        kind: raw.kind,
        tag: raw.tag.to_ascii_lowercase(),
        role: raw.role.trim().to_ascii_lowercase(),
        text: truncate_chars(&collapse_whitespace(&raw.text), ELEMENT_TEXT_MAX_CHARS),
        has_box: raw.has_box,
        enabled: raw.enabled,
        href: raw.href.filter(|h| !h.trim().is_empty()),
        value: raw.value.filter(|v| !v.is_empty()),
    }
}

pub(crate) fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Keep whole lines of page text until the character budget is spent.
fn condense(text: &str, budget: usize) -> String {
    let mut out = String::new();
    let mut total = 0;
    for line in text.lines().map(collapse_whitespace).filter(|l| !l.is_empty()) {
        let len = line.chars().count();
        if total + len > budget {
            if out.is_empty() {
                out.push_str(&truncate_chars(&line, budget));
            }
            out.push_str("\n... [truncated]");
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&line);
        total += len + 1;
    }
    out
}
