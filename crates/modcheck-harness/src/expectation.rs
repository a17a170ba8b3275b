//! Expectation sets: which entry points a fixture must export and how they behave.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use modcheck_core::{InvocationResult, InvocationSpec, Value};
use serde::{Deserialize, Serialize};

use crate::diff;

/// One expected entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expectation {
    /// Exported symbol name (exact, case-sensitive).
    pub symbol: String,
    /// Declared C signature.
    pub spec: InvocationSpec,
    /// Arguments to pass, in order.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Decides whether the call's outcome passes.
    pub expect: Predicate,
    /// A missing required symbol fails the session; a missing optional one is skipped.
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_required() -> bool {
    true
}

impl Expectation {
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        spec: InvocationSpec,
        args: Vec<Value>,
        expect: Predicate,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            spec,
            args,
            expect,
            required: true,
            description: None,
        }
    }

    /// Mark the entry as optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An ordered list of expectations for one fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectationSet {
    /// Schema version.
    pub version: String,
    /// Fixture name, used in reports and trace IDs.
    pub fixture: String,
    pub entries: Vec<Expectation>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExpectationFileError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing expectation set: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExpectationSet {
    #[must_use]
    pub fn new(fixture: impl Into<String>, entries: Vec<Expectation>) -> Self {
        Self {
            version: "v1".to_string(),
            fixture: fixture.into(),
            entries,
        }
    }

    /// Load an expectation set from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to pretty JSON. Fails if any entry uses a custom predicate.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load an expectation set from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ExpectationFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| ExpectationFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_json(&content)?)
    }

    /// Problems an expectation set has before it is ever run against a module.
    ///
    /// Argument lists are checked against their declared signatures here, so a
    /// malformed file is reported without loading anything.
    #[must_use]
    pub fn lint(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.entries.is_empty() {
            problems.push("expectation set has no entries".to_string());
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.symbol.trim().is_empty() {
                problems.push(format!("entry {i}: empty symbol name"));
            }
            if let Err(err) = modcheck_core::check_signature(&entry.symbol, &entry.spec, &entry.args) {
                problems.push(format!("entry {i}: {err}"));
            }
        }
        problems
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Decides whether an invocation result is acceptable.
///
/// Return values are never interpreted by the invoker; every meaning
/// ("truthy", "echoes its argument", ...) lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Returns(i32),
    ReturnsNot(i32),
    /// Returned a nonzero value.
    Truthy,
    /// Returned zero.
    Falsy,
    /// The signature declares a `void` return and the call completed.
    ReturnsNothing,
    StdoutContains(String),
    StdoutEquals(String),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    /// Rust-side closure; cannot be written to or read from JSON.
    #[serde(skip)]
    Custom(CustomPredicate),
}

/// Why a predicate rejected a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub expected: String,
    pub actual: String,
    pub diff: Option<String>,
}

impl Predicate {
    /// Wrap a closure as a named predicate.
    pub fn custom(
        name: impl Into<String>,
        check: impl Fn(&InvocationResult) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Custom(CustomPredicate {
            name: name.into(),
            check: Arc::new(check),
        })
    }

    pub fn evaluate(&self, result: &InvocationResult) -> Result<(), Mismatch> {
        let accepted = match self {
            Self::Returns(want) => result.returned == Some(*want),
            Self::ReturnsNot(unwanted) => result.returned.is_some_and(|v| v != *unwanted),
            Self::Truthy => result.returned.is_some_and(|v| v != 0),
            Self::Falsy => result.returned == Some(0),
            Self::ReturnsNothing => result.returned.is_none() && result.completed,
            Self::StdoutContains(needle) => result.stdout.contains(needle.as_str()),
            Self::StdoutEquals(text) => {
                if result.stdout == *text {
                    return Ok(());
                }
                return Err(Mismatch {
                    expected: self.to_string(),
                    actual: format!("stdout {:?}", result.stdout),
                    diff: Some(diff::render_diff(text, &result.stdout)),
                });
            }
            Self::All(all) => {
                for predicate in all {
                    predicate.evaluate(result)?;
                }
                return Ok(());
            }
            Self::Any(any) => any.iter().any(|p| p.evaluate(result).is_ok()),
            Self::Custom(custom) => (custom.check)(result),
        };
        if accepted {
            Ok(())
        } else {
            Err(Mismatch {
                expected: self.to_string(),
                actual: describe_actual(self, result),
                diff: None,
            })
        }
    }
}

fn describe_actual(predicate: &Predicate, result: &InvocationResult) -> String {
    match predicate {
        Predicate::StdoutContains(_) => format!("stdout {:?}", result.stdout),
        _ => match result.returned {
            Some(value) => format!("returned {value}"),
            None => "returned nothing".to_string(),
        },
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Returns(v) => write!(f, "returns {v}"),
            Self::ReturnsNot(v) => write!(f, "returns anything but {v}"),
            Self::Truthy => f.write_str("returns nonzero"),
            Self::Falsy => f.write_str("returns 0"),
            Self::ReturnsNothing => f.write_str("returns nothing"),
            Self::StdoutContains(s) => write!(f, "stdout contains {s:?}"),
            Self::StdoutEquals(s) => write!(f, "stdout equals {s:?}"),
            Self::All(all) => write!(f, "all of [{}]", join(all)),
            Self::Any(any) => write!(f, "any of [{}]", join(any)),
            Self::Custom(custom) => write!(f, "custom `{}`", custom.name),
        }
    }
}

fn join(predicates: &[Predicate]) -> String {
    predicates
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A named closure predicate.
#[derive(Clone)]
pub struct CustomPredicate {
    name: String,
    check: Arc<dyn Fn(&InvocationResult) -> bool + Send + Sync>,
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomPredicate")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
