//! The narrow capability surface the crawler needs from a browser.
//!
//! The crawler only ever holds a handle implementing [`BrowserSession`]; launching,
//! attaching and tearing down the browser belong to the implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::types::{ElementKind, ScrollDirection};

/// Current document location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

/// Element record as reported by the page, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawElement {
    pub id: String,
    pub kind: ElementKind,
    pub tag: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub has_box: bool,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub elements: Vec<RawElement>,
    #[serde(default)]
    pub text: String,
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Load `url` in the current tab.
    async fn load(&self, url: &str) -> Result<(), SessionError>;

    /// Current URL and title. Fails with [`SessionError::Detached`] when no document is loaded.
    async fn location(&self) -> Result<PageInfo, SessionError>;

    /// Tag and report interactive elements in document order.
    async fn query_elements(&self) -> Result<RawSnapshot, SessionError>;

    async fn click(&self, element_id: &str) -> Result<(), SessionError>;

    async fn type_text(&self, element_id: &str, text: &str) -> Result<(), SessionError>;

    async fn scroll(&self, direction: ScrollDirection) -> Result<(), SessionError>;

    /// Resolve once the page looks settled, or fail with [`SessionError::Timeout`].
    async fn wait_settled(&self, timeout: Duration) -> Result<(), SessionError>;
}
