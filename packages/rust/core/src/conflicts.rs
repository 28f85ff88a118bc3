//! Pluggable detection of contradicting claims about one subject.

use docgraph_shared::ClaimsConfig;

/// Words that flip the polarity of a statement.
const NEGATIONS: &[&str] = &[
    "not", "no", "never", "cannot", "can't", "doesn't", "don't", "isn't", "aren't", "won't",
    "without", "unsupported", "lacks", "deprecated",
];

/// The parts of a claim a policy looks at.
#[derive(Debug, Clone, Copy)]
pub struct ClaimView<'a> {
    pub statement: &'a str,
    pub claim_type: &'a str,
}

/// Decides whether two claims about the same subject contradict each other.
pub trait ConflictPolicy: Send + Sync {
    /// The reason the claims conflict, or `None`. `distance` is the cosine
    /// distance between the two statement embeddings.
    fn conflicts(&self, a: ClaimView<'_>, b: ClaimView<'_>, distance: f32) -> Option<String>;
}

/// Never reports a conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConflicts;

impl ConflictPolicy for NoConflicts {
    fn conflicts(&self, _a: ClaimView<'_>, _b: ClaimView<'_>, _distance: f32) -> Option<String> {
        None
    }
}

/// Flags claims on the same topic whose types oppose each other, or whose
/// types match but exactly one statement is negated.
#[derive(Debug, Clone)]
pub struct ClaimTypeConflictPolicy {
    opposing: Vec<(String, String)>,
    topic_threshold: f32,
}

impl ClaimTypeConflictPolicy {
    pub fn new(config: &ClaimsConfig) -> Self {
        Self {
            opposing: config
                .opposing_types
                .iter()
                .map(|(a, b)| (normalize_type(a), normalize_type(b)))
                .collect(),
            topic_threshold: config.conflict_threshold,
        }
    }

    fn opposed(&self, a: &str, b: &str) -> bool {
        self.opposing
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }
}

impl Default for ClaimTypeConflictPolicy {
    fn default() -> Self {
        Self::new(&ClaimsConfig::default())
    }
}

impl ConflictPolicy for ClaimTypeConflictPolicy {
    fn conflicts(&self, a: ClaimView<'_>, b: ClaimView<'_>, distance: f32) -> Option<String> {
        if distance > self.topic_threshold {
            return None;
        }
        let type_a = normalize_type(a.claim_type);
        let type_b = normalize_type(b.claim_type);
        if self.opposed(&type_a, &type_b) {
            return Some(format!("opposing claim types {type_a} / {type_b}"));
        }
        if type_a == type_b && is_negated(a.statement) != is_negated(b.statement) {
            return Some(format!("negated {type_a} claim"));
        }
        None
    }
}

fn normalize_type(claim_type: &str) -> String {
    claim_type.trim().to_lowercase().replace([' ', '-'], "_")
}

/// Whether the statement contains a negation word (or "no longer").
pub fn is_negated(statement: &str) -> bool {
    let lower = statement.to_lowercase();
    lower
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .any(|word| NEGATIONS.contains(&word))
        || lower.contains("no longer")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view<'a>(statement: &'a str, claim_type: &'a str) -> ClaimView<'a> {
        ClaimView {
            statement,
            claim_type,
        }
    }

    #[test]
    fn opposing_types_on_same_topic_conflict() {
        let policy = ClaimTypeConflictPolicy::default();
        let reason = policy.conflicts(
            view("React supports server rendering", "capability"),
            view("React server rendering is limited to Node", "Limitation"),
            0.2,
        );
        assert!(reason.unwrap().contains("capability"));
    }

    #[test]
    fn different_topics_never_conflict() {
        let policy = ClaimTypeConflictPolicy::default();
        assert!(
            policy
                .conflicts(
                    view("React supports hooks", "capability"),
                    view("React has no built-in router", "limitation"),
                    0.8,
                )
                .is_none()
        );
    }

    #[test]
    fn negation_within_one_type_conflicts() {
        let policy = ClaimTypeConflictPolicy::default();
        assert!(
            policy
                .conflicts(
                    view("Deno supports npm packages", "supports"),
                    view("Deno doesn't support npm packages", "supports"),
                    0.1,
                )
                .is_some()
        );
        assert!(
            policy
                .conflicts(
                    view("Deno supports npm packages", "supports"),
                    view("Deno supports JSR packages", "supports"),
                    0.1,
                )
                .is_none()
        );
    }

    #[test]
    fn negation_detection() {
        assert!(is_negated("It is no longer maintained"));
        assert!(is_negated("You cannot nest routers"));
        assert!(!is_negated("Notifications are batched"));
    }

    #[test]
    fn no_conflicts_policy() {
        assert!(
            NoConflicts
                .conflicts(view("a", "capability"), view("a", "limitation"), 0.0)
                .is_none()
        );
    }
}
