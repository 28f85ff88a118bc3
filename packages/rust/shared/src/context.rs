//! Run scoping: which documents a run may see, and who the run is.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// FilterSpec
// ---------------------------------------------------------------------------

/// Immutable description of which documents (and document-scoped rows) a run may see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Explicit document ids. Empty means "no id restriction".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub document_ids: Vec<String>,
    /// Fetch status (e.g. `fetched`, `failed`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Glob over the document source locator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Document cluster membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<i64>,
    /// Content type (e.g. `text/html`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Maximum number of documents the selection yields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl FilterSpec {
    /// True when any document-selection predicate beyond the id list is set.
    pub fn has_selection(&self) -> bool {
        self.limit.is_some()
            || self.status.is_some()
            || self.pattern.is_some()
            || self.cluster_id.is_some()
            || self.content_type.is_some()
    }

    /// Compiled form of [`FilterSpec::pattern`], if any.
    pub fn pattern_regex(&self) -> Option<regex::Regex> {
        self.pattern.as_deref().and_then(glob_to_regex)
    }
}

/// Convert a glob-like pattern to a regex.
///
/// `**` spans path segments, `*` stays within one, `?` is a single char.
pub fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", ".");
    regex::Regex::new(&format!("^{escaped}$")).ok()
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Per-run identity plus the filter spec, passed to every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    /// Identifier scoping one pipeline execution.
    pub run_id: String,
    /// Skip documents already processed by an earlier run.
    pub incremental: bool,
    /// Reprocess documents even in incremental mode.
    pub reprocess: bool,
    /// Document selection for this run.
    pub filter: FilterSpec,
    /// Document ids resolved by the orchestrator from `filter`.
    #[serde(default)]
    resolved_document_ids: Vec<String>,
}

impl RunContext {
    /// A full (non-incremental) run with no document filter.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            incremental: false,
            reprocess: false,
            filter: FilterSpec::default(),
            resolved_document_ids: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn with_reprocess(mut self, reprocess: bool) -> Self {
        self.reprocess = reprocess;
        self
    }

    /// Record the document ids the orchestrator selected for this run.
    pub fn with_resolved_document_ids(mut self, ids: Vec<String>) -> Self {
        self.resolved_document_ids = ids;
        self
    }

    /// Resolved document ids. Empty means "nothing narrowed", not "nothing selected".
    pub fn resolved_document_ids(&self) -> &[String] {
        &self.resolved_document_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_segments() {
        let re = glob_to_regex("https://docs.example.com/*/intro").expect("compile");
        assert!(re.is_match("https://docs.example.com/guide/intro"));
        assert!(!re.is_match("https://docs.example.com/guide/deep/intro"));

        let re = glob_to_regex("https://docs.example.com/**").expect("compile");
        assert!(re.is_match("https://docs.example.com/guide/deep/intro"));
    }

    #[test]
    fn empty_filter_has_no_selection() {
        assert!(!FilterSpec::default().has_selection());
        let spec = FilterSpec {
            status: Some("fetched".into()),
            ..Default::default()
        };
        assert!(spec.has_selection());
        let capped = FilterSpec {
            limit: Some(3),
            ..Default::default()
        };
        assert!(capped.has_selection());
    }

    #[test]
    fn context_builders() {
        let ctx = RunContext::new("run-1")
            .with_incremental(true)
            .with_resolved_document_ids(vec!["d1".into()]);
        assert!(ctx.incremental);
        assert!(!ctx.reprocess);
        assert_eq!(ctx.resolved_document_ids(), ["d1".to_string()]);
    }
}
