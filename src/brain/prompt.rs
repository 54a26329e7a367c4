use std::fmt::Write as _;

use super::PlanRequest;
use crate::dom::truncate_chars;
use crate::types::ElementKind;

const SYSTEM_PROMPT: &str = r#"You are a web exploration agent driving a real browser one step at a time.
Your mission is the goal given by the user. When the goal is open-ended, explore the site and reach new, distinct page states.

Reply with ONE JSON object and nothing else. Available actions:
- {"action":"click","element_id":"e3"}
- {"action":"type","element_id":"e5","text":"test@example.com"}
- {"action":"navigate","url":"https://same-site.example/path"}
- {"action":"scroll","direction":"down"}        (up | down | top | bottom)
- {"action":"wait","duration_ms":1000}
- {"action":"finish","reason":"why you stop","goal_reached":true}

Rules:
1. Only use element ids listed for the CURRENT page. Never refer to elements by their text.
2. Prefer elements not marked [x]; those were already tried from this exact page.
3. Fill forms with realistic test values before submitting them.
4. Use finish with goal_reached=true when the goal is accomplished, or goal_reached=false when nothing new is left to try."#;

const ELEMENTS_IN_PROMPT: usize = 60;
const PAGE_TEXT_IN_PROMPT: usize = 1500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Render the state, goal and bounded history into a prompt.
pub fn build(request: &PlanRequest<'_>, correction: Option<&str>) -> Prompt {
    let state = request.state;
    let acted_on = request.visit.map(|v| &v.acted_on);
    let mut user = String::new();

    let _ = writeln!(user, "Goal: {}\n", request.goal);
    let _ = writeln!(user, "Current page: {}", state.title);
    let _ = writeln!(user, "URL: {}", state.url);
    if let Some(visit) = request.visit {
        let _ = writeln!(user, "Times this exact page was seen: {}", visit.visit_count);
    }
    if state.partial {
        let _ = writeln!(user, "Note: the page had not finished loading; the list may be incomplete.");
    }

    let _ = writeln!(user, "\nClickable elements ([x] = already tried here):");
    write_elements(&mut user, request, ElementKind::Clickable, acted_on);
    let _ = writeln!(user, "\nFillable elements:");
    write_elements(&mut user, request, ElementKind::Fillable, acted_on);

    if let Some(text) = &state.text {
        let _ = writeln!(user, "\nPage text:\n{}", truncate_chars(text, PAGE_TEXT_IN_PROMPT));
    }

    let digest = request.history.digest().render();
    let recent: Vec<String> = request.history.recent().map(|s| s.summary_line()).collect();
    if !digest.is_empty() || !recent.is_empty() {
        let _ = writeln!(user, "\nHistory:");
        if !digest.is_empty() {
            let _ = writeln!(user, "{digest}");
        }
        for line in recent {
            let _ = writeln!(user, "{line}");
        }
    }

    if let Some(note) = correction {
        let _ = writeln!(user, "\nCORRECTION: {note}");
    }
    let _ = write!(user, "\nWhat is your next step? Reply with one JSON object.");

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

fn write_elements(
    out: &mut String,
    request: &PlanRequest<'_>,
    kind: ElementKind,
    acted_on: Option<&std::collections::BTreeSet<String>>,
) {
    let mut any = false;
    for element in request
        .state
        .elements
        .iter()
        .filter(|e| e.kind == kind)
        .take(ELEMENTS_IN_PROMPT)
    {
        any = true;
        let tried = acted_on.is_some_and(|ids| ids.contains(&element.id));
        let _ = write!(
            out,
            "[{}] {} {} role={} \"{}\"",
            if tried { "x" } else { " " },
            element.id,
            element.tag,
            element.role,
            truncate_chars(&element.text, 80)
        );
        if !element.enabled {
            let _ = write!(out, " (disabled)");
        }
        if !element.has_box {
            let _ = write!(out, " (not visible)");
        }
        if let Some(href) = &element.href {
            let _ = write!(out, " href={href}");
        }
        if let Some(value) = &element.value {
            let _ = write!(out, " value=\"{value}\"");
        }
        out.push('\n');
    }
    if !any {
        out.push_str("(none)\n");
    }
}
