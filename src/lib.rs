//! Goal-directed web exploration: an LLM proposes one browser action at a time while
//! the crawler dedupes page states, bounds every step and recovers from failures.

pub mod brain;
pub mod config;
pub mod crawler;
pub mod dom;
pub mod error;
pub mod executor;
pub mod hands;
pub mod history;
pub mod session;
pub mod types;
pub mod visited;

pub use brain::{Brain, ReasoningProvider};
pub use config::{CrawlConfig, Credentials, ModelSettings};
pub use crawler::{CrawlEvent, CrawlOutcome, Crawler, StateTransition};
pub use error::{CrawlError, Result};
pub use session::BrowserSession;
pub use types::{Action, PageState, StepResult, TerminationReason};
