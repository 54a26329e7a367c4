use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use crate::types::{ErrorClass, StepResult};

const DIGEST_LINES: usize = 20;

/// Compressed account of the steps that fell out of the history window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryDigest {
    pub summarized: usize,
    pub failures: BTreeMap<ErrorClass, usize>,
    /// One line per summarized step, most recent last; only the newest few are kept.
    pub lines: VecDeque<String>,
}

impl HistoryDigest {
    fn absorb(&mut self, step: &StepResult) {
        self.summarized += 1;
        for class in step.problem_classes() {
            *self.failures.entry(class).or_default() += 1;
        }
        self.lines.push_back(step.summary_line());
        while self.lines.len() > DIGEST_LINES {
            self.lines.pop_front();
        }
    }

    pub fn render(&self) -> String {
        if self.summarized == 0 {
            return String::new();
        }
        let failures: Vec<String> = self
            .failures
            .iter()
            .map(|(class, n)| format!("{class:?}={n}"))
            .collect();
        let mut out = format!(
            "{} earlier steps summarized (failures: {})",
            self.summarized,
            if failures.is_empty() {
                "none".to_string()
            } else {
                failures.join(", ")
            }
        );
        for line in &self.lines {
            out.push_str("\n  ");
            out.push_str(line);
        }
        out
    }
}

/// Append-only step history with a bounded verbatim window.
#[derive(Debug, Clone, Serialize)]
pub struct History {
    window: usize,
    total: usize,
    recent: VecDeque<StepResult>,
    digest: HistoryDigest,
}

impl History {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            total: 0,
            recent: VecDeque::new(),
            digest: HistoryDigest::default(),
        }
    }

    /// Append a step, assigning its index, and fold the oldest entries into the digest.
    pub fn push(&mut self, mut step: StepResult) {
        step.index = self.total;
        self.total += 1;
        self.recent.push_back(step);
        while self.recent.len() > self.window {
            if let Some(old) = self.recent.pop_front() {
                self.digest.absorb(&old);
            }
        }
    }

    /// Total number of entries ever appended.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn recent(&self) -> impl Iterator<Item = &StepResult> {
        self.recent.iter()
    }

    pub fn last(&self) -> Option<&StepResult> {
        self.recent.back()
    }

    pub fn digest(&self) -> &HistoryDigest {
        &self.digest
    }

    /// Failures per class over the whole run, including summarized steps and problems
    /// recovered within successful steps.
    pub fn failure_counts(&self) -> BTreeMap<ErrorClass, usize> {
        let mut counts = self.digest.failures.clone();
        for class in self.recent.iter().flat_map(StepResult::problem_classes) {
            *counts.entry(class).or_default() += 1;
        }
        counts
    }
}
