//! Report generation for session verdicts.

use serde::{Deserialize, Serialize};

use crate::structured_log::now_utc;
use crate::verdict::{EntryStatus, Verdict};

/// A session report: one verdict plus when and what was tested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// Report title.
    pub title: String,
    /// Timestamp (UTC).
    pub timestamp: String,
    pub verdict: Verdict,
}

impl SessionReport {
    #[must_use]
    pub fn new(title: impl Into<String>, verdict: Verdict) -> Self {
        Self {
            title: title.into(),
            timestamp: now_utc(),
            verdict,
        }
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let v = &self.verdict;
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Fixture: {}\n", v.fixture()));
        out.push_str(&format!("- Module: `{}`\n", v.module()));
        if let Some(sha) = v.module_sha256() {
            out.push_str(&format!("- SHA-256: `{sha}`\n"));
        }
        out.push_str(&format!("- Timestamp: {}\n", self.timestamp));
        out.push_str(&format!(
            "- Verdict: {}\n",
            if v.passed() { "PASS" } else { "FAIL" }
        ));
        out.push_str(&format!(
            "- States: {}\n",
            v.trail()
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        ));
        out.push_str(&format!("- Passed: {}\n", v.passed_count()));
        out.push_str(&format!("- Failed: {}\n", v.failed_count()));
        out.push_str(&format!("- Skipped: {}\n", v.skipped_count()));
        if let Some(failure) = v.failure() {
            out.push_str(&format!("- Failure: {failure}\n"));
        }
        out.push('\n');

        out.push_str("| Symbol | Returned | Status | Detail |\n");
        out.push_str("|--------|----------|--------|--------|\n");
        for e in v.entries() {
            let returned = e.returned.map_or_else(|| "-".to_string(), |r| r.to_string());
            let detail = match &e.status {
                EntryStatus::Failed { reason } | EntryStatus::Skipped { reason } => {
                    reason.to_string().replace('|', "\\|")
                }
                EntryStatus::Passed | EntryStatus::NotRun => {
                    e.description.clone().unwrap_or_default()
                }
            };
            out.push_str(&format!(
                "| `{}` | {} | {} | {} |\n",
                e.symbol,
                returned,
                e.status.label(),
                detail
            ));
        }

        for e in v.entries().iter().filter(|e| e.diff.is_some()) {
            if let Some(diff) = &e.diff {
                out.push_str(&format!("\n## `{}` stdout diff\n\n```diff\n{diff}```\n", e.symbol));
            }
        }

        for (label, text) in [
            ("Initializer output", v.init_output()),
            ("Finalizer output", v.finalizer_output()),
        ] {
            if !text.is_empty() {
                out.push_str(&format!("\n## {label}\n\n```text\n{text}"));
                if !text.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str("```\n");
            }
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expectation::{Expectation, ExpectationSet, Predicate};
    use crate::session::run_session;
    use modcheck_core::InvocationSpec;

    fn failed_verdict() -> Verdict {
        let set = ExpectationSet::new(
            "ghost",
            vec![Expectation::new(
                "hello",
                InvocationSpec::ints(1).unwrap(),
                vec![0.into()],
                Predicate::Returns(0),
            )],
        );
        run_session("/nonexistent/modcheck/libghost.so", set)
    }

    #[test]
    fn markdown_names_failure_and_entries() {
        let report = SessionReport::new("ghost fixture", failed_verdict());
        let md = report.to_markdown();
        assert!(md.starts_with("# ghost fixture\n"));
        assert!(md.contains("- Verdict: FAIL"));
        assert!(md.contains("- States: idle -> failed"));
        assert!(md.contains("module not found"));
        assert!(md.contains("| `hello` | - | NOT RUN |"));
    }

    #[test]
    fn json_round_trips_verdict() {
        let report = SessionReport::new("ghost fixture", failed_verdict());
        let parsed: SessionReport = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(parsed.verdict, report.verdict);
        assert_eq!(parsed.title, "ghost fixture");
    }
}
