mod support;

use support::*;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use usagi::brain::ModelProvider;
use usagi::error::{ReasoningError, SessionError};
use usagi::types::{ActionSource, ErrorClass};
use usagi::{Action, Brain, CrawlConfig, CrawlError, CrawlEvent, Crawler, TerminationReason};

const GOAL: &str = "explore the site";

fn single(provider: ScriptedProvider) -> Brain {
    Brain::new(provider.boxed(), None, 3)
}

fn config() -> CrawlConfig {
    CrawlConfig {
        max_revisits: 3,
        ..CrawlConfig::default()
    }
}

fn home_with_dead_button() -> ScriptedSession {
    ScriptedSession::new()
        .page(HOME, "Home", vec![button("b1", "Does nothing")])
        .on_click(HOME, "b1", Transition::Stay)
}

#[tokio::test]
async fn test_no_op_button_ends_at_revisit_limit() {
    let session = home_with_dead_button();
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);

    let outcome = Crawler::new(&session, single(provider), config())
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::LoopLimit);
    assert_eq!(session.clicks().len(), 4);
    assert_eq!(outcome.steps_taken, 4);
    assert_eq!(outcome.states_discovered, 1);
    assert!(outcome.final_fingerprint.is_some());
}

#[tokio::test]
async fn test_finish_on_first_step_reaches_goal() {
    let session = home_with_dead_button();
    let provider = ScriptedProvider::new("primary", vec![finish("done")]);
    let (events, mut rx) = broadcast::channel(64);

    let outcome = Crawler::new(&session, single(provider), config())
        .with_events(events)
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::GoalReached);
    assert_eq!(outcome.steps_taken, 1);
    assert_eq!(outcome.history.len(), 1);
    assert!(session.clicks().is_empty());
    assert!(outcome.transitions.is_empty());
    assert_eq!(outcome.elements_interacted, 0);

    let mut received = Vec::new();
    while let Ok(event) = rx.try_recv() {
        received.push(event);
    }
    assert!(matches!(received.first(), Some(CrawlEvent::Started { .. })));
    assert!(matches!(
        received.last(),
        Some(CrawlEvent::Terminated {
            reason: TerminationReason::GoalReached,
            steps: 1,
            ..
        })
    ));
}

#[tokio::test]
async fn test_finish_without_goal_is_model_requested() {
    let session = home_with_dead_button();
    let provider = ScriptedProvider::new(
        "primary",
        vec![Ok(Action::Finish {
            reason: "nothing left to try".into(),
            goal_reached: false,
        })],
    );

    let outcome = Crawler::new(&session, single(provider), config())
        .run(HOME, GOAL)
        .await
        .unwrap();
    assert_eq!(outcome.reason, TerminationReason::ModelRequested);
}

#[tokio::test]
async fn test_transient_failures_switch_to_fallback() {
    let session = home_with_dead_button()
        .page(ABOUT, "About", vec![button("b1", "Back")])
        .on_click(HOME, "b1", Transition::Goto(ABOUT.into()));
    let primary = ScriptedProvider::new(
        "primary",
        vec![transient("primary"), transient("primary"), transient("primary")],
    );
    let primary_seen = primary.seen();
    let fallback = ScriptedProvider::new("fallback", vec![click("b1"), finish("found about")]);

    let brain = Brain::new(primary.boxed(), Some(fallback.boxed()), 3);
    let outcome = Crawler::new(&session, brain, config())
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::GoalReached);
    assert_eq!(outcome.provider, "fallback");
    assert!(outcome.provider_switched);
    assert_eq!(outcome.steps_taken, 2);
    assert_eq!(outcome.failures.get(&ErrorClass::ReasoningTransient), Some(&3));
    assert_eq!(outcome.states_discovered, 2);

    // Re-planning on the same snapshot does not count as another visit.
    let seen = primary_seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|s| s.visit_count == Some(1) && s.url == HOME));
}

#[tokio::test]
async fn test_stale_element_is_replanned_without_using_a_step() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![button("b1", "Gone"), button("b2", "Here")])
        .on_click(HOME, "b1", Transition::Stale);
    let provider = ScriptedProvider::new("primary", vec![click("b1"), finish("ok")]);

    let outcome = Crawler::new(&session, single(provider), config())
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::GoalReached);
    assert_eq!(outcome.steps_taken, 1);
    assert_eq!(outcome.failures.get(&ErrorClass::StaleElement), Some(&1));
    let first = outcome.history.recent().next().unwrap();
    assert!(!first.success);
    assert_eq!(first.error_class(), Some(ErrorClass::StaleElement));
}

#[tokio::test]
async fn test_element_missing_from_snapshot_is_stale() {
    let session = home_with_dead_button();
    let provider = ScriptedProvider::new("primary", vec![click("e42"), finish("ok")]);

    let outcome = Crawler::new(&session, single(provider), config())
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::GoalReached);
    assert!(session.clicks().is_empty());
    assert_eq!(outcome.failures.get(&ErrorClass::StaleElement), Some(&1));
}

#[tokio::test]
async fn test_endless_stale_elements_exhaust_failure_budget() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![button("b1", "Flaky")])
        .on_click(HOME, "b1", Transition::Stale);
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);
    let config = CrawlConfig {
        stale_retry_limit: 2,
        failure_budget: 3,
        max_revisits: 50,
        ..CrawlConfig::default()
    };

    let outcome = Crawler::new(&session, single(provider), config)
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(
        outcome.reason,
        TerminationReason::ExecutionFailureBudgetExhausted
    );
    assert_eq!(outcome.steps_taken, 3);
    assert_eq!(outcome.history.len(), 5);
}

#[tokio::test]
async fn test_failing_clicks_exhaust_failure_budget() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![button("b1", "Broken")])
        .on_click(HOME, "b1", Transition::Fail(SessionError::Other("boom".into())));
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);
    let config = CrawlConfig {
        failure_budget: 2,
        max_revisits: 50,
        ..CrawlConfig::default()
    };

    let outcome = Crawler::new(&session, single(provider), config)
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(
        outcome.reason,
        TerminationReason::ExecutionFailureBudgetExhausted
    );
    assert_eq!(outcome.steps_taken, 2);
    assert_eq!(outcome.failures.get(&ErrorClass::Unknown), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_click_times_out_and_crawl_continues() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![button("b1", "Spinner")])
        .on_click(HOME, "b1", Transition::Hang);
    let provider = ScriptedProvider::new("primary", vec![click("b1"), finish("gave up on spinner")]);
    let config = CrawlConfig {
        step_timeout_ms: 1_000,
        ..config()
    };

    let outcome = Crawler::new(&session, single(provider), config)
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::GoalReached);
    assert_eq!(outcome.failures.get(&ErrorClass::Timeout), Some(&1));
    assert_eq!(outcome.steps_taken, 2);
}

#[tokio::test]
async fn test_lost_page_ends_with_extraction_failure() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![button("b1", "Close tab")])
        .on_click(HOME, "b1", Transition::Detach);
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);
    let config = CrawlConfig {
        extraction_retry_limit: 3,
        ..config()
    };

    let outcome = Crawler::new(&session, single(provider), config)
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::ExtractionFailed);
    assert_eq!(outcome.steps_taken, 1);
    // The unreadable page right after the click, then four planning attempts.
    assert_eq!(outcome.failures.get(&ErrorClass::Extraction), Some(&5));

    let click_step = outcome.history.recent().next().unwrap();
    assert!(click_step.success);
    assert!(click_step.error.is_none());
    assert!(click_step.state.is_none());
    assert_eq!(
        click_step.problem_classes().collect::<Vec<_>>(),
        vec![ErrorClass::Extraction]
    );
    assert!(outcome.transitions.is_empty());
}

#[tokio::test]
async fn test_unsettled_page_is_recorded_on_a_successful_step() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![button("b1", "Load more")])
        .on_click(HOME, "b1", Transition::Unsettle);
    let provider = ScriptedProvider::new("primary", vec![click("b1"), finish("loaded")]);

    let outcome = Crawler::new(&session, single(provider), config())
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::GoalReached);
    assert_eq!(outcome.steps_taken, 2);
    assert_eq!(outcome.failures.get(&ErrorClass::Timeout), Some(&1));

    let click_step = outcome.history.recent().next().unwrap();
    assert!(click_step.success);
    assert_eq!(click_step.recovered.len(), 1);
    assert_eq!(click_step.recovered[0].class, ErrorClass::Timeout);
    assert!(click_step.state.as_ref().is_some_and(|s| s.partial));
}

#[tokio::test]
async fn test_loop_breaker_tries_an_untried_element() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![button("b1", "Tried"), button("b2", "Untried")])
        .on_click(HOME, "b1", Transition::Stay)
        .on_click(HOME, "b2", Transition::Stay);
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);
    let config = CrawlConfig {
        max_revisits: 1,
        ..CrawlConfig::default()
    };

    let outcome = Crawler::new(&session, single(provider), config)
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::LoopLimit);
    assert_eq!(session.clicks(), vec!["b1", "b1", "b2"]);
    let last = outcome.history.last().unwrap();
    assert_eq!(last.source, ActionSource::LoopBreaker);
}

#[tokio::test]
async fn test_loop_breaking_can_be_disabled() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![button("b1", "Tried"), button("b2", "Untried")]);
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);
    let config = CrawlConfig {
        max_revisits: 1,
        loop_breaking: false,
        ..CrawlConfig::default()
    };

    let outcome = Crawler::new(&session, single(provider), config)
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::LoopLimit);
    assert_eq!(session.clicks(), vec!["b1", "b1"]);
}

#[tokio::test]
async fn test_step_budget_bounds_a_ping_pong_site() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![button("b1", "About")])
        .page(ABOUT, "About", vec![button("b1", "Home")])
        .on_click(HOME, "b1", Transition::Goto(ABOUT.into()))
        .on_click(ABOUT, "b1", Transition::Goto(HOME.into()));
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);
    let config = CrawlConfig {
        max_steps: 5,
        max_revisits: 10,
        ..CrawlConfig::default()
    };

    let outcome = Crawler::new(&session, single(provider), config)
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::StepBudgetExhausted);
    assert_eq!(outcome.steps_taken, 5);
    assert_eq!(outcome.states_discovered, 2);

    // Home -> About -> Home -> ...: five edges over two states, one element tried on each.
    assert_eq!(outcome.transitions.len(), 5);
    assert_eq!(outcome.elements_interacted, 2);
    let (first, second) = (&outcome.transitions[0], &outcome.transitions[1]);
    assert_ne!(first.from, first.to);
    assert_eq!(first.to, second.from);
    assert_eq!(first.from, second.to);
    assert_eq!(first.action, Action::Click { element_id: "b1".into() });
    assert_eq!(
        outcome.final_fingerprint.as_ref(),
        Some(&outcome.transitions[4].to)
    );
}

#[tokio::test]
async fn test_typing_and_navigation() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![text_input("e0", "Search"), button("e1", "Go")])
        .page(ABOUT, "About", vec![]);
    let provider = ScriptedProvider::new(
        "primary",
        vec![
            Ok(Action::Type {
                element_id: "e0".into(),
                text: "rabbit".into(),
            }),
            Ok(Action::Navigate {
                url: "https://site.test/missing".into(),
            }),
            Ok(Action::Navigate { url: ABOUT.into() }),
            finish("reached about"),
        ],
    );

    let outcome = Crawler::new(&session, single(provider), config())
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::GoalReached);
    assert_eq!(session.typed(), vec![("e0".to_string(), "rabbit".to_string())]);
    assert_eq!(session.current_url().as_deref(), Some(ABOUT));
    assert_eq!(outcome.failures.get(&ErrorClass::NavigationFailed), Some(&1));
    assert_eq!(outcome.steps_taken, 4);
}

#[tokio::test]
async fn test_always_failing_provider_terminates() {
    let session = home_with_dead_button();
    let provider = ScriptedProvider::new("primary", vec![transient("primary")]);

    let outcome = Crawler::new(&session, single(provider), config())
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::ProviderExhausted);
    assert_eq!(outcome.steps_taken, 0);
    assert_eq!(outcome.history.len(), 3);
}

#[tokio::test]
async fn test_permanent_error_switches_immediately() {
    let session = home_with_dead_button();
    let primary = ScriptedProvider::new(
        "primary",
        vec![Err(ReasoningError::permanent("primary", "invalid api key"))],
    );
    let fallback = ScriptedProvider::new("fallback", vec![finish("done")]);

    let brain = Brain::new(primary.boxed(), Some(fallback.boxed()), 3);
    let outcome = Crawler::new(&session, brain, config())
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::GoalReached);
    assert_eq!(outcome.provider, "fallback");
    assert_eq!(outcome.failures.get(&ErrorClass::ReasoningPermanent), Some(&1));
}

#[tokio::test]
async fn test_unparseable_model_output_terminates() {
    let session = home_with_dead_button();
    let client = ScriptedClient::new(
        "rambling",
        vec![Ok("I would probably click the blue button near the top.".to_string())],
    );
    let prompts = client.prompts();
    let brain = Brain::new(Box::new(ModelProvider::new(client)), None, 3);

    let outcome = Crawler::new(&session, brain, config())
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::ProviderExhausted);
    assert_eq!(outcome.steps_taken, 0);
    assert_eq!(outcome.failures.get(&ErrorClass::ReasoningTransient), Some(&3));
    // Each proposal is one prompt plus one correction.
    assert_eq!(prompts.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn test_model_replies_drive_the_crawl() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![button("e0", "About us")])
        .page(ABOUT, "About", vec![button("e0", "Home")])
        .on_click(HOME, "e0", Transition::Goto(ABOUT.into()));
    let client = ScriptedClient::new(
        "gemini",
        vec![
            Ok("```json\n{\"action\":\"click\",\"element_id\":\"e0\"}\n```".to_string()),
            Ok(r#"{"action":"finish","reason":"about page found","goal_reached":true}"#.to_string()),
        ],
    );
    let prompts = client.prompts();
    let brain = Brain::new(Box::new(ModelProvider::new(client)), None, 3);

    let outcome = Crawler::new(&session, brain, config())
        .run(HOME, "find the about page")
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::GoalReached);
    assert_eq!(session.clicks(), vec!["e0"]);
    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].user.contains("Goal: find the about page"));
    assert!(prompts[1].user.contains("URL: https://site.test/about"));
    assert!(prompts[1].user.contains("History:"));
}

#[tokio::test]
async fn test_cancelled_run_stops() {
    let session = home_with_dead_button();
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = Crawler::new(&session, single(provider), config())
        .with_cancellation(cancel)
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::Cancelled);
    assert_eq!(outcome.steps_taken, 0);
    assert!(session.clicks().is_empty());
}

#[tokio::test]
async fn test_zero_duration_hits_deadline() {
    let session = home_with_dead_button();
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);
    let config = CrawlConfig {
        max_duration_secs: 0,
        ..config()
    };

    let outcome = Crawler::new(&session, single(provider), config)
        .run(HOME, GOAL)
        .await
        .unwrap();

    assert_eq!(outcome.reason, TerminationReason::DeadlineExceeded);
    assert_eq!(outcome.steps_taken, 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_stops_a_run_of_slow_steps() {
    let session = ScriptedSession::new()
        .page(HOME, "Home", vec![button("b1", "Spinner")])
        .on_click(HOME, "b1", Transition::Hang);
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);
    let config = CrawlConfig {
        step_timeout_ms: 1_000,
        max_duration_secs: 2,
        ..config()
    };

    let outcome = Crawler::new(&session, single(provider), config)
        .run(HOME, GOAL)
        .await
        .unwrap();

    // Each hanging click burns one second of the two-second budget.
    assert_eq!(outcome.reason, TerminationReason::DeadlineExceeded);
    assert_eq!(outcome.steps_taken, 2);
    assert_eq!(outcome.failures.get(&ErrorClass::Timeout), Some(&2));
}

#[tokio::test]
async fn test_unreachable_start_page_is_fatal() {
    let session = home_with_dead_button();
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);

    let result = Crawler::new(&session, single(provider), config())
        .run("https://nowhere.test/", GOAL)
        .await;

    assert!(matches!(
        result,
        Err(CrawlError::Session(SessionError::Navigation(_)))
    ));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let session = home_with_dead_button();
    let provider = ScriptedProvider::new("primary", vec![click("b1")]);
    let config = CrawlConfig {
        max_steps: 0,
        ..CrawlConfig::default()
    };

    let result = Crawler::new(&session, single(provider), config)
        .run(HOME, GOAL)
        .await;
    assert!(matches!(result, Err(CrawlError::Config(_))));
}
