use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::CrawlConfig;
use crate::dom::Snapshotter;
use crate::error::SessionError;
use crate::session::BrowserSession;
use crate::types::{Action, ErrorClass, PageState, StepError, StepResult};

/// Thin adapter from [`Action`] values to session calls, with failure classification.
pub struct ActionExecutor {
    step_timeout: Duration,
    settle_timeout: Duration,
    snapshotter: Snapshotter,
}

impl ActionExecutor {
    pub fn new(config: &CrawlConfig) -> Self {
        Self {
            step_timeout: config.step_timeout(),
            settle_timeout: config.settle_timeout(),
            snapshotter: Snapshotter::new(config),
        }
    }

    /// Perform `action`, planned against `current`, and report what happened.
    ///
    /// Never fails: every problem comes back as an unsuccessful [`StepResult`].
    pub async fn execute(
        &self,
        session: &dyn BrowserSession,
        action: &Action,
        current: &PageState,
    ) -> StepResult {
        if action.is_finish() {
            return StepResult::succeeded(action.clone(), Some(current.clone()));
        }

        if let Some(id) = action.element_id() {
            if current.element(id).is_none() {
                return StepResult::failed(
                    Some(action.clone()),
                    StepError::new(
                        ErrorClass::StaleElement,
                        format!("element {id} is not on the current page"),
                    ),
                    None,
                );
            }
        }

        if let Err(e) = self.perform(session, action).await {
            debug!(action = %action, error = %e, "Action failed");
            return StepResult::failed(
                Some(action.clone()),
                StepError::new(e.class(), e.to_string()),
                None,
            );
        }

        let mut recovered = Vec::new();
        match timeout(self.settle_timeout, session.wait_settled(self.settle_timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Page still busy after action");
                recovered.push(StepError::new(e.class(), format!("page did not settle: {e}")));
            }
            Err(_) => {
                debug!("Settle wait timed out after action");
                recovered.push(StepError::new(
                    ErrorClass::Timeout,
                    format!(
                        "page did not settle within {}ms",
                        self.settle_timeout.as_millis()
                    ),
                ));
            }
        }

        let state = match self.snapshotter.snapshot(session).await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(action = %action, error = %e, "Could not read page after action");
                recovered.push(StepError::new(ErrorClass::Extraction, e.to_string()));
                None
            }
        };
        let mut result = StepResult::succeeded(action.clone(), state);
        result.recovered = recovered;
        result
    }

    async fn perform(&self, session: &dyn BrowserSession, action: &Action) -> Result<(), SessionError> {
        let call = async {
            match action {
                Action::Click { element_id } => session.click(element_id).await,
                Action::Type { element_id, text } => session.type_text(element_id, text).await,
                Action::Navigate { url } => session.load(url).await,
                Action::Scroll { direction } => session.scroll(*direction).await,
                Action::Wait { duration_ms } => {
                    tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                    Ok(())
                }
                Action::Finish { .. } => Ok(()),
            }
        };
        timeout(self.step_timeout, call).await.map_err(|_| {
            SessionError::Timeout(format!(
                "{action} did not complete within {}ms",
                self.step_timeout.as_millis()
            ))
        })?
    }
}
