//! In-memory doubles for the browser and the reasoning provider.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use usagi::brain::{ModelClient, PlanRequest, Prompt, ReasoningProvider};
use usagi::error::{ReasoningError, SessionError};
use usagi::session::{BrowserSession, PageInfo, RawElement, RawSnapshot};
use usagi::types::{Action, ElementKind, ScrollDirection};

pub const HOME: &str = "https://site.test/";
pub const ABOUT: &str = "https://site.test/about";

/// What clicking an element does to the scripted page graph.
#[derive(Debug, Clone)]
pub enum Transition {
    Stay,
    Goto(String),
    /// The element vanished between extraction and the click.
    Stale,
    Fail(SessionError),
    /// The click never returns.
    Hang,
    /// The tab goes away; every later read fails.
    Detach,
    /// The page keeps loading; every later settle wait times out.
    Unsettle,
}

struct Page {
    title: String,
    elements: Vec<RawElement>,
    text: String,
}

#[derive(Default)]
struct Live {
    current: Option<String>,
    clicks: Vec<String>,
    typed: Vec<(String, String)>,
    unsettled: bool,
}

/// A browser whose pages and click transitions are fixed up front.
#[derive(Default)]
pub struct ScriptedSession {
    pages: HashMap<String, Page>,
    transitions: HashMap<(String, String), Transition>,
    live: Mutex<Live>,
}

pub fn button(id: &str, text: &str) -> RawElement {
    RawElement {
        id: id.to_string(),
        kind: ElementKind::Clickable,
        tag: "button".to_string(),
        role: "button".to_string(),
        text: text.to_string(),
        has_box: true,
        enabled: true,
        href: None,
        value: None,
    }
}

pub fn text_input(id: &str, label: &str) -> RawElement {
    RawElement {
        id: id.to_string(),
        kind: ElementKind::Fillable,
        tag: "input".to_string(),
        role: "textbox".to_string(),
        text: label.to_string(),
        has_box: true,
        enabled: true,
        href: None,
        value: Some(String::new()),
    }
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, title: &str, elements: Vec<RawElement>) -> Self {
        self.pages.insert(
            url.to_string(),
            Page {
                title: title.to_string(),
                elements,
                text: format!("{title} body"),
            },
        );
        self
    }

    pub fn on_click(mut self, url: &str, element_id: &str, transition: Transition) -> Self {
        self.transitions
            .insert((url.to_string(), element_id.to_string()), transition);
        self
    }

    pub fn clicks(&self) -> Vec<String> {
        self.live.lock().unwrap().clicks.clone()
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.live.lock().unwrap().typed.clone()
    }

    pub fn current_url(&self) -> Option<String> {
        self.live.lock().unwrap().current.clone()
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn load(&self, url: &str) -> Result<(), SessionError> {
        if !self.pages.contains_key(url) {
            return Err(SessionError::Navigation(format!("{url} is unreachable")));
        }
        self.live.lock().unwrap().current = Some(url.to_string());
        Ok(())
    }

    async fn location(&self) -> Result<PageInfo, SessionError> {
        let current = self.current_url().ok_or(SessionError::Detached)?;
        let page = &self.pages[&current];
        Ok(PageInfo {
            url: current,
            title: page.title.clone(),
        })
    }

    async fn query_elements(&self) -> Result<RawSnapshot, SessionError> {
        let current = self.current_url().ok_or(SessionError::Detached)?;
        let page = &self.pages[&current];
        Ok(RawSnapshot {
            elements: page.elements.clone(),
            text: page.text.clone(),
        })
    }

    async fn click(&self, element_id: &str) -> Result<(), SessionError> {
        let transition = {
            let mut live = self.live.lock().unwrap();
            live.clicks.push(element_id.to_string());
            let current = live.current.clone().ok_or(SessionError::Detached)?;
            self.transitions
                .get(&(current, element_id.to_string()))
                .cloned()
                .unwrap_or(Transition::Stay)
        };
        match transition {
            Transition::Stay => Ok(()),
            Transition::Goto(url) => {
                self.live.lock().unwrap().current = Some(url);
                Ok(())
            }
            Transition::Stale => Err(SessionError::NoSuchElement(element_id.to_string())),
            Transition::Fail(e) => Err(e),
            Transition::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Transition::Detach => {
                self.live.lock().unwrap().current = None;
                Ok(())
            }
            Transition::Unsettle => {
                self.live.lock().unwrap().unsettled = true;
                Ok(())
            }
        }
    }

    async fn type_text(&self, element_id: &str, text: &str) -> Result<(), SessionError> {
        self.live
            .lock()
            .unwrap()
            .typed
            .push((element_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn scroll(&self, _direction: ScrollDirection) -> Result<(), SessionError> {
        Ok(())
    }

    async fn wait_settled(&self, _timeout: Duration) -> Result<(), SessionError> {
        if self.live.lock().unwrap().unsettled {
            return Err(SessionError::Timeout("page still loading".into()));
        }
        Ok(())
    }
}

/// What a [`ScriptedProvider`] saw on each call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub url: String,
    pub visit_count: Option<usize>,
    pub history_len: usize,
}

/// Replays a fixed list of replies; the last one repeats forever.
pub struct ScriptedProvider {
    name: &'static str,
    script: Mutex<VecDeque<Result<Action, ReasoningError>>>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl ScriptedProvider {
    pub fn new(name: &'static str, script: Vec<Result<Action, ReasoningError>>) -> Self {
        assert!(!script.is_empty(), "script needs at least one reply");
        Self {
            name,
            script: Mutex::new(script.into()),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<Seen>>> {
        self.seen.clone()
    }

    pub fn boxed(self) -> Box<dyn ReasoningProvider> {
        Box::new(self)
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn propose(&self, request: PlanRequest<'_>) -> Result<Action, ReasoningError> {
        self.seen.lock().unwrap().push(Seen {
            url: request.state.url.clone(),
            visit_count: request.visit.map(|v| v.visit_count),
            history_len: request.history.len(),
        });
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

pub fn click(id: &str) -> Result<Action, ReasoningError> {
    Ok(Action::Click {
        element_id: id.to_string(),
    })
}

pub fn finish(reason: &str) -> Result<Action, ReasoningError> {
    Ok(Action::Finish {
        reason: reason.to_string(),
        goal_reached: true,
    })
}

pub fn transient(provider: &str) -> Result<Action, ReasoningError> {
    Err(ReasoningError::transient(provider, "503 service unavailable"))
}

/// Raw model replies for driving the real prompt, parse and re-prompt path.
pub struct ScriptedClient {
    name: &'static str,
    replies: Mutex<VecDeque<Result<String, ReasoningError>>>,
    prompts: Arc<Mutex<Vec<Prompt>>>,
}

impl ScriptedClient {
    pub fn new(name: &'static str, replies: Vec<Result<String, ReasoningError>>) -> Self {
        assert!(!replies.is_empty(), "script needs at least one reply");
        Self {
            name,
            replies: Mutex::new(replies.into()),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn prompts(&self) -> Arc<Mutex<Vec<Prompt>>> {
        self.prompts.clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn name(&self) -> &str {
        self.name
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, ReasoningError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        let mut replies = self.replies.lock().unwrap();
        if replies.len() > 1 {
            replies.pop_front().unwrap()
        } else {
            replies.front().cloned().unwrap()
        }
    }
}
