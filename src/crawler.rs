//! The crawl orchestrator: snapshot, dedupe, plan, execute, evaluate, repeat.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::brain::{Brain, PlanError, PlanRequest};
use crate::config::CrawlConfig;
use crate::dom::Snapshotter;
use crate::error::{CrawlError, SessionError};
use crate::executor::ActionExecutor;
use crate::history::History;
use crate::session::BrowserSession;
use crate::types::{
    Action, ActionSource, ElementKind, ErrorClass, PageState, StepError, StepResult,
    TerminationReason,
};
use crate::visited::{StateFingerprint, VisitDecision, VisitedRegistry, fingerprint};

/// Progress notifications for observers such as the live viewer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CrawlEvent {
    Started {
        url: String,
        goal: String,
        provider: String,
    },
    Planning {
        iteration: usize,
        step: usize,
        url: String,
        fingerprint: String,
        fresh: bool,
    },
    Proposed {
        step: usize,
        action: String,
        source: ActionSource,
    },
    StepFinished {
        index: usize,
        action: String,
        success: bool,
        error: Option<StepError>,
    },
    Recovered {
        class: ErrorClass,
        message: String,
    },
    ProviderSwitched {
        provider: String,
    },
    Terminated {
        reason: TerminationReason,
        steps: usize,
        states: usize,
    },
}

/// One executed edge of the explored state graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: StateFingerprint,
    pub to: StateFingerprint,
    pub action: Action,
}

/// What a finished run hands back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlOutcome {
    pub reason: TerminationReason,
    pub steps_taken: usize,
    pub final_fingerprint: Option<StateFingerprint>,
    pub states_discovered: usize,
    /// Successful actions that produced a readable page, in execution order.
    pub transitions: Vec<StateTransition>,
    /// Distinct (state, element) pairs acted on.
    pub elements_interacted: usize,
    pub provider: String,
    pub provider_switched: bool,
    pub failures: BTreeMap<ErrorClass, usize>,
    pub history: History,
}

struct Planned {
    action: Action,
    source: ActionSource,
    state: PageState,
    fingerprint: StateFingerprint,
}

struct Evaluated {
    result: StepResult,
    fingerprint: StateFingerprint,
}

enum Phase {
    Planning,
    Executing(Planned),
    Evaluating(Evaluated),
    Terminated(TerminationReason),
}

/// One exploration run over a borrowed browser session.
pub struct Crawler<'a> {
    session: &'a dyn BrowserSession,
    brain: Brain,
    config: CrawlConfig,
    snapshotter: Snapshotter,
    executor: ActionExecutor,
    registry: VisitedRegistry,
    history: History,
    transitions: Vec<StateTransition>,
    cancel: CancellationToken,
    events: Option<broadcast::Sender<CrawlEvent>>,
    iteration: usize,
    steps_taken: usize,
    failures: usize,
    stale_retries: usize,
    extraction_failures: usize,
    /// Page read by the executor after the last action; saves one extraction.
    pending: Option<PageState>,
    /// State whose visit is already recorded and that must be planned again.
    replan: Option<(PageState, StateFingerprint)>,
    last_fingerprint: Option<StateFingerprint>,
}

impl<'a> Crawler<'a> {
    pub fn new(session: &'a dyn BrowserSession, brain: Brain, config: CrawlConfig) -> Self {
        Self {
            session,
            brain,
            snapshotter: Snapshotter::new(&config),
            executor: ActionExecutor::new(&config),
            registry: VisitedRegistry::new(config.max_revisits),
            history: History::new(config.history_window),
            transitions: Vec::new(),
            config,
            cancel: CancellationToken::new(),
            events: None,
            iteration: 0,
            steps_taken: 0,
            failures: 0,
            stale_retries: 0,
            extraction_failures: 0,
            pending: None,
            replan: None,
            last_fingerprint: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<CrawlEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Token that stops the run at the next phase boundary when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load `start_url` and explore toward `goal` until a terminal state.
    ///
    /// Only configuration problems and a failed initial load are errors; every budget
    /// running out is reported through [`CrawlOutcome::reason`].
    pub async fn run(mut self, start_url: &str, goal: &str) -> Result<CrawlOutcome, CrawlError> {
        self.config.validate()?;

        info!(url = %start_url, goal = %goal, provider = self.brain.active_name(), "Starting crawl");
        match timeout(self.config.step_timeout(), self.session.load(start_url)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CrawlError::Session(SessionError::Timeout(format!(
                    "initial load of {start_url}"
                ))));
            }
        }
        self.emit(CrawlEvent::Started {
            url: start_url.to_string(),
            goal: goal.to_string(),
            provider: self.brain.active_name().to_string(),
        });

        let started = Instant::now();
        let mut phase = Phase::Planning;
        let reason = loop {
            if self.cancel.is_cancelled() && !matches!(phase, Phase::Terminated(_)) {
                info!("Crawl cancelled");
                phase = Phase::Terminated(TerminationReason::Cancelled);
            }
            phase = match phase {
                Phase::Planning => self.plan(goal, started).await,
                Phase::Executing(planned) => self.execute(planned).await,
                Phase::Evaluating(evaluated) => self.evaluate(evaluated),
                Phase::Terminated(reason) => break reason,
            };
        };

        info!(
            reason = ?reason,
            steps = self.steps_taken,
            states = self.registry.len(),
            "Crawl finished"
        );
        self.emit(CrawlEvent::Terminated {
            reason,
            steps: self.steps_taken,
            states: self.registry.len(),
        });

        Ok(CrawlOutcome {
            reason,
            steps_taken: self.steps_taken,
            final_fingerprint: self.last_fingerprint,
            states_discovered: self.registry.len(),
            transitions: self.transitions,
            elements_interacted: self.registry.elements_interacted(),
            provider: self.brain.active_name().to_string(),
            provider_switched: self.brain.has_switched(),
            failures: self.history.failure_counts(),
            history: self.history,
        })
    }

    async fn plan(&mut self, goal: &str, started: Instant) -> Phase {
        if started.elapsed() >= self.config.max_duration() {
            return Phase::Terminated(TerminationReason::DeadlineExceeded);
        }
        if self.steps_taken >= self.config.max_steps {
            return Phase::Terminated(TerminationReason::StepBudgetExhausted);
        }
        self.iteration += 1;

        let (state, fp) = match self.replan.take() {
            Some(kept) => kept,
            None => {
                let state = match self.pending.take() {
                    Some(state) => state,
                    None => match self.snapshotter.snapshot(self.session).await {
                        Ok(state) => state,
                        Err(e) => {
                            self.extraction_failures += 1;
                            self.record_planning_failure(StepError::new(
                                ErrorClass::Extraction,
                                e.to_string(),
                            ));
                            if self.extraction_failures > self.config.extraction_retry_limit {
                                return Phase::Terminated(TerminationReason::ExtractionFailed);
                            }
                            return Phase::Planning;
                        }
                    },
                };
                self.extraction_failures = 0;

                let fp = fingerprint(&state);
                let decision = self.registry.record(&fp, self.iteration);
                self.last_fingerprint = Some(fp.clone());
                info!(
                    step = self.steps_taken + 1,
                    state = %fp.short(),
                    decision = ?decision,
                    page = %state.summary(),
                    "Planning"
                );
                self.emit(CrawlEvent::Planning {
                    iteration: self.iteration,
                    step: self.steps_taken + 1,
                    url: state.url.clone(),
                    fingerprint: fp.to_string(),
                    fresh: decision == VisitDecision::Fresh,
                });

                if decision == VisitDecision::LimitExceeded {
                    return match self.loop_breaker(&state, &fp) {
                        Some(action) => {
                            info!(action = %action, "Revisit limit hit, trying an untried element");
                            Phase::Executing(Planned {
                                action,
                                source: ActionSource::LoopBreaker,
                                state,
                                fingerprint: fp,
                            })
                        }
                        None => Phase::Terminated(TerminationReason::LoopLimit),
                    };
                }
                (state, fp)
            }
        };

        let request = PlanRequest {
            state: &state,
            goal,
            history: &self.history,
            visit: self.registry.get(&fp),
            config: &self.config,
        };
        let was_switched = self.brain.has_switched();
        let result = self.brain.propose(request).await;
        if self.brain.has_switched() && !was_switched {
            self.emit(CrawlEvent::ProviderSwitched {
                provider: self.brain.active_name().to_string(),
            });
        }

        match result {
            Ok(action) => Phase::Executing(Planned {
                action,
                source: ActionSource::Model,
                state,
                fingerprint: fp,
            }),
            Err(PlanError::Retry(err)) => {
                warn!(error = %err, "Reasoning failed, planning again");
                self.record_planning_failure(StepError::new(err.class(), err.to_string()));
                self.replan = Some((state, fp));
                Phase::Planning
            }
            Err(PlanError::Exhausted(err)) => {
                warn!(error = %err, "No reasoning provider left");
                self.record_planning_failure(StepError::new(err.class(), err.to_string()));
                Phase::Terminated(TerminationReason::ProviderExhausted)
            }
        }
    }

    /// An enabled, visible clickable element not yet tried from this state.
    fn loop_breaker(&self, state: &PageState, fp: &StateFingerprint) -> Option<Action> {
        if !self.config.loop_breaking {
            return None;
        }
        let acted_on = self.registry.get(fp).map(|r| &r.acted_on);
        let untried: Vec<&str> = state
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::Clickable && e.enabled && e.has_box)
            .filter(|e| !acted_on.is_some_and(|ids| ids.contains(&e.id)))
            .map(|e| e.id.as_str())
            .collect();
        if untried.is_empty() {
            return None;
        }
        let pick = (rand::random::<u64>() % untried.len() as u64) as usize;
        Some(Action::Click {
            element_id: untried[pick].to_string(),
        })
    }

    async fn execute(&mut self, planned: Planned) -> Phase {
        info!(
            step = self.steps_taken + 1,
            action = %planned.action,
            source = ?planned.source,
            "Executing"
        );
        self.emit(CrawlEvent::Proposed {
            step: self.steps_taken + 1,
            action: planned.action.to_string(),
            source: planned.source,
        });

        let mut result = self
            .executor
            .execute(self.session, &planned.action, &planned.state)
            .await;
        result.source = planned.source;
        result.iteration = self.iteration;
        Phase::Evaluating(Evaluated {
            result,
            fingerprint: planned.fingerprint,
        })
    }

    fn evaluate(&mut self, evaluated: Evaluated) -> Phase {
        let Evaluated {
            result,
            fingerprint: fp,
        } = evaluated;
        let class = result.error_class();

        if class != Some(ErrorClass::StaleElement) {
            if let Some(id) = result.action.as_ref().and_then(Action::element_id) {
                self.registry.mark_acted(&fp, id);
            }
        }

        match class {
            None => {
                self.steps_taken += 1;
                self.stale_retries = 0;
                let finish = match &result.action {
                    Some(Action::Finish { goal_reached, .. }) => Some(*goal_reached),
                    _ => None,
                };
                if let Some(state) = &result.state {
                    let to = fingerprint(state);
                    if let (None, Some(action)) = (finish, &result.action) {
                        self.transitions.push(StateTransition {
                            from: fp.clone(),
                            to: to.clone(),
                            action: action.clone(),
                        });
                    }
                    self.last_fingerprint = Some(to);
                }
                self.pending = result.state.clone();
                self.push_step(result);

                match finish {
                    Some(true) => Phase::Terminated(TerminationReason::GoalReached),
                    Some(false) => Phase::Terminated(TerminationReason::ModelRequested),
                    None => Phase::Planning,
                }
            }
            Some(ErrorClass::StaleElement) if self.stale_retries < self.config.stale_retry_limit => {
                self.stale_retries += 1;
                debug!(retries = self.stale_retries, "Stale element, re-planning on a fresh snapshot");
                self.push_step(result);
                Phase::Planning
            }
            Some(class) => {
                self.steps_taken += 1;
                self.failures += 1;
                warn!(
                    class = ?class,
                    failures = self.failures,
                    budget = self.config.failure_budget,
                    "Step failed"
                );
                self.pending = result.state.clone();
                self.push_step(result);
                if self.failures >= self.config.failure_budget {
                    Phase::Terminated(TerminationReason::ExecutionFailureBudgetExhausted)
                } else {
                    Phase::Planning
                }
            }
        }
    }

    fn push_step(&mut self, step: StepResult) {
        let index = self.history.len();
        self.emit(CrawlEvent::StepFinished {
            index,
            action: step
                .action
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            success: step.success,
            error: step.error.clone(),
        });
        for err in step.error.iter().chain(&step.recovered) {
            self.emit(CrawlEvent::Recovered {
                class: err.class,
                message: err.message.clone(),
            });
        }
        self.history.push(step);
    }

    fn record_planning_failure(&mut self, error: StepError) {
        let mut step = StepResult::failed(None, error, None);
        step.iteration = self.iteration;
        self.push_step(step);
    }

    fn emit(&self, event: CrawlEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
