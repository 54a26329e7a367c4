use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether the model can click an element or type into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Clickable,
    Fillable,
}

/// One interactive element of a page, addressed by its `data-usagi-id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRef {
    pub id: String,
    pub kind: ElementKind,
    pub tag: String,
    pub role: String,
    pub text: String,
    pub has_box: bool,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Normalized snapshot of the interactive surface of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub elements: Vec<ElementRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Set when extraction hit its time bound and this is a best-effort view.
    #[serde(default)]
    pub partial: bool,
}

impl PageState {
    pub fn element(&self, id: &str) -> Option<&ElementRef> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// One-line description used in logs and prompts.
    pub fn summary(&self) -> String {
        let clickables = self
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::Clickable)
            .count();
        format!(
            "{} {} clickables:{} fillables:{}{}",
            self.title,
            self.url,
            clickables,
            self.elements.len() - clickables,
            if self.partial { " (partial)" } else { "" }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Top,
    Bottom,
}

fn goal_reached_default() -> bool {
    true
}

/// A single atomic step the reasoning provider asks the crawler to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Click {
        #[serde(alias = "target_id")]
        element_id: String,
    },
    Type {
        #[serde(alias = "target_id")]
        element_id: String,
        #[serde(alias = "fill_value")]
        text: String,
    },
    Navigate {
        url: String,
    },
    Scroll {
        direction: ScrollDirection,
    },
    Wait {
        duration_ms: u64,
    },
    Finish {
        reason: String,
        #[serde(default = "goal_reached_default")]
        goal_reached: bool,
    },
}

impl Action {
    /// The element this action targets, if any.
    pub fn element_id(&self) -> Option<&str> {
        match self {
            Action::Click { element_id } | Action::Type { element_id, .. } => Some(element_id),
            _ => None,
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Action::Finish { .. })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click { element_id } => write!(f, "click {element_id}"),
            Action::Type { element_id, text } => write!(f, "type {element_id} {text:?}"),
            Action::Navigate { url } => write!(f, "navigate {url}"),
            Action::Scroll { direction } => write!(f, "scroll {direction:?}"),
            Action::Wait { duration_ms } => write!(f, "wait {duration_ms}ms"),
            Action::Finish { reason, .. } => write!(f, "finish {reason:?}"),
        }
    }
}

/// Classification attached to every failure recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Extraction,
    ReasoningTransient,
    ReasoningPermanent,
    StaleElement,
    Timeout,
    NavigationFailed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub class: ErrorClass,
    pub message: String,
}

impl StepError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

/// Who chose the action of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    Model,
    LoopBreaker,
}

/// What happened in one loop iteration.
///
/// `action` is `None` when the iteration failed before anything could be executed
/// (extraction or reasoning), so recovered planning failures still leave a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub iteration: usize,
    pub source: ActionSource,
    pub action: Option<Action>,
    pub success: bool,
    pub error: Option<StepError>,
    /// Problems on a step that still succeeded, such as a page that never settled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovered: Vec<StepError>,
    pub state: Option<PageState>,
}

impl StepResult {
    pub fn succeeded(action: Action, state: Option<PageState>) -> Self {
        Self {
            index: 0,
            iteration: 0,
            source: ActionSource::Model,
            action: Some(action),
            success: true,
            error: None,
            recovered: Vec::new(),
            state,
        }
    }

    pub fn failed(action: Option<Action>, error: StepError, state: Option<PageState>) -> Self {
        Self {
            index: 0,
            iteration: 0,
            source: ActionSource::Model,
            action,
            success: false,
            error: Some(error),
            recovered: Vec::new(),
            state,
        }
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(|e| e.class)
    }

    pub fn with_recovered(mut self, error: StepError) -> Self {
        self.recovered.push(error);
        self
    }

    /// Every classified problem on this step, fatal or recovered.
    pub fn problem_classes(&self) -> impl Iterator<Item = ErrorClass> + '_ {
        self.error.iter().chain(&self.recovered).map(|e| e.class)
    }

    pub fn summary_line(&self) -> String {
        let action = self
            .action
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "(planning)".to_string());
        let mut line = match &self.error {
            None => format!("#{} {} -> ok", self.index, action),
            Some(err) => format!("#{} {} -> {:?}: {}", self.index, action, err.class, err.message),
        };
        for err in &self.recovered {
            line.push_str(&format!(" (recovered {:?}: {})", err.class, err.message));
        }
        line
    }
}

/// Why a crawl run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    GoalReached,
    ModelRequested,
    LoopLimit,
    StepBudgetExhausted,
    DeadlineExceeded,
    ExecutionFailureBudgetExhausted,
    ExtractionFailed,
    ProviderExhausted,
    Cancelled,
}

pub const ELEMENT_TEXT_MAX_CHARS: usize = 200;
pub const ID_ATTRIBUTE: &str = "data-usagi-id";
