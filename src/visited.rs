//! State fingerprints and the visited-state registry used for loop prevention.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::types::{ElementKind, PageState};

/// Query parameters that carry per-request noise rather than page identity.
const VOLATILE_PARAMS: &[&str] = &[
    "sid", "session", "sessionid", "session_id", "phpsessid", "jsessionid", "token",
    "csrf", "csrf_token", "nonce", "ts", "timestamp", "time", "t", "_", "cb", "cachebuster",
    "rand", "random", "fbclid", "gclid",
];

/// Hex SHA-256 digest identifying semantically equivalent page states.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateFingerprint(String);

impl StateFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for StateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of the normalized URL and the ordered element structure.
///
/// Titles, free text, input values and layout are left out so that counters, clocks
/// and typed text do not make an unchanged page look new.
pub fn fingerprint(state: &PageState) -> StateFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(&state.url).as_bytes());
    hasher.update(b"\n");
    for element in &state.elements {
        let kind = match element.kind {
            ElementKind::Clickable => "c",
            ElementKind::Fillable => "f",
        };
        let line = format!(
            "{}|{}|{}|{}|{}\n",
            kind,
            element.tag,
            element.role,
            element.text.to_lowercase(),
            element.enabled
        );
        hasher.update(line.as_bytes());
    }
    StateFingerprint(format!("{:x}", hasher.finalize()))
}

fn is_volatile(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("utm_") || VOLATILE_PARAMS.contains(&name.as_str())
}

/// Drop the fragment and volatile parameters, sort what remains.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.trim().to_string();
    };
    url.set_fragment(None);
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_volatile(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();
    if params.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(params);
    }
    url.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisitRecord {
    pub fingerprint: StateFingerprint,
    pub visit_count: usize,
    pub first_seen: usize,
    /// Element ids an action was already attempted on from this state.
    pub acted_on: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitDecision {
    Fresh,
    SeenAgain(usize),
    LimitExceeded,
}

#[derive(Debug, Default)]
pub struct VisitedRegistry {
    max_revisits: usize,
    records: HashMap<StateFingerprint, VisitRecord>,
}

impl VisitedRegistry {
    pub fn new(max_revisits: usize) -> Self {
        Self {
            max_revisits,
            records: HashMap::new(),
        }
    }

    /// Count one more visit of `fingerprint` at loop `iteration`.
    pub fn record(&mut self, fingerprint: &StateFingerprint, iteration: usize) -> VisitDecision {
        let record = self
            .records
            .entry(fingerprint.clone())
            .or_insert_with(|| VisitRecord {
                fingerprint: fingerprint.clone(),
                visit_count: 0,
                first_seen: iteration,
                acted_on: BTreeSet::new(),
            });
        record.visit_count += 1;

        let revisits = record.visit_count - 1;
        if revisits == 0 {
            VisitDecision::Fresh
        } else if revisits > self.max_revisits {
            VisitDecision::LimitExceeded
        } else {
            VisitDecision::SeenAgain(revisits)
        }
    }

    pub fn mark_acted(&mut self, fingerprint: &StateFingerprint, element_id: &str) {
        if let Some(record) = self.records.get_mut(fingerprint) {
            record.acted_on.insert(element_id.to_string());
        }
    }

    pub fn get(&self, fingerprint: &StateFingerprint) -> Option<&VisitRecord> {
        self.records.get(fingerprint)
    }

    /// Distinct elements acted on, summed over all states.
    pub fn elements_interacted(&self) -> usize {
        self.records.values().map(|r| r.acted_on.len()).sum()
    }

    /// Number of distinct states seen so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementRef;

    fn page(url: &str, texts: &[&str]) -> PageState {
        PageState {
            url: url.into(),
            title: "Title".into(),
            elements: texts
                .iter()
                .enumerate()
                .map(|(i, t)| ElementRef {
                    id: format!("e{i}"),
                    kind: ElementKind::Clickable,
                    tag: "button".into(),
                    role: "button".into(),
                    text: t.to_string(),
                    has_box: true,
                    enabled: true,
                    href: None,
                    value: None,
                })
                .collect(),
            text: None,
            partial: false,
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = page("https://site.test/a", &["Next", "Back"]);
        let mut b = a.clone();
        b.title = "A clock says 12:01".into();
        b.text = Some("volatile body".into());
        assert_eq!(fingerprint(&a), fingerprint(&a));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_sees_structural_changes() {
        let base = page("https://site.test/a", &["Next", "Back"]);
        let reordered = page("https://site.test/a", &["Back", "Next"]);
        let other_url = page("https://site.test/b", &["Next", "Back"]);
        let mut disabled = base.clone();
        disabled.elements[0].enabled = false;

        let fp = fingerprint(&base);
        assert_ne!(fp, fingerprint(&reordered));
        assert_ne!(fp, fingerprint(&other_url));
        assert_ne!(fp, fingerprint(&disabled));
    }

    #[test]
    fn test_fingerprint_ignores_volatile_url_parts() {
        let a = page("https://site.test/list?page=2&sid=abc&_=171#top", &["Next"]);
        let b = page("https://site.test/list?ts=99&page=2", &["Next"]);
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(
            fingerprint(&a),
            fingerprint(&page("https://site.test/list?page=3", &["Next"]))
        );
    }

    #[test]
    fn test_normalize_url_sorts_params() {
        assert_eq!(
            normalize_url("https://site.test/p?b=2&a=1&utm_source=x"),
            "https://site.test/p?a=1&b=2"
        );
        assert_eq!(normalize_url("not a url"), "not a url");
    }

    #[test]
    fn test_registry_monotonic_until_limit() {
        let mut registry = VisitedRegistry::new(3);
        let fp = fingerprint(&page("https://site.test/", &["Next"]));

        assert_eq!(registry.record(&fp, 0), VisitDecision::Fresh);
        assert_eq!(registry.record(&fp, 1), VisitDecision::SeenAgain(1));
        assert_eq!(registry.record(&fp, 2), VisitDecision::SeenAgain(2));
        assert_eq!(registry.record(&fp, 3), VisitDecision::SeenAgain(3));
        assert_eq!(registry.record(&fp, 4), VisitDecision::LimitExceeded);
        assert_eq!(registry.record(&fp, 5), VisitDecision::LimitExceeded);

        let record = registry.get(&fp).unwrap();
        assert_eq!(record.visit_count, 6);
        assert_eq!(record.first_seen, 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_zero_revisits_limits_on_first_repeat() {
        let mut registry = VisitedRegistry::new(0);
        let fp = fingerprint(&page("https://site.test/", &[]));
        assert_eq!(registry.record(&fp, 0), VisitDecision::Fresh);
        assert_eq!(registry.record(&fp, 1), VisitDecision::LimitExceeded);
    }

    #[test]
    fn test_mark_acted_tracks_elements_per_state() {
        let mut registry = VisitedRegistry::new(3);
        let a = fingerprint(&page("https://site.test/a", &["Next"]));
        let b = fingerprint(&page("https://site.test/b", &["Next"]));
        registry.record(&a, 0);
        registry.record(&b, 1);
        registry.mark_acted(&a, "e0");

        assert!(registry.get(&a).unwrap().acted_on.contains("e0"));
        assert!(registry.get(&b).unwrap().acted_on.is_empty());

        registry.mark_acted(&a, "e0");
        registry.mark_acted(&b, "e0");
        registry.mark_acted(&b, "e1");
        assert_eq!(registry.elements_interacted(), 3);
    }
}
