//! Parsing of the model's page response into typed records.
//!
//! ## Degrade, never fail
//!
//! Even a well-prompted model occasionally wraps its JSON in markdown fences,
//! prefixes it with a sentence of prose, emits `null` for unknown values or
//! returns something that is not JSON at all. [`parse_response`] cleans the
//! common quirks first and, if the text still does not parse, returns an
//! empty extraction tagged `Other` with a diagnostic instead of an error.
//! The page is still marked `PROCESSED`; the diagnostic explains why it
//! produced nothing.
//!
//! ## Cleanup order
//!
//! Invisible characters go first so fence detection sees clean input; fences
//! are stripped before the outermost `{ … }` is cut out of any remaining
//! prose.

use crate::model::{CategoryLabel, Diagnosis, Medication, SubjectAttributes, TestResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

/// Justification recorded when the response could not be parsed.
pub const UNPARSEABLE_JUSTIFICATION: &str = "Unable to categorize";

/// One category assigned to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCategory {
    pub label: CategoryLabel,
    pub justification: String,
}

/// Everything extracted from one page response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageExtraction {
    pub categories: Vec<ExtractedCategory>,
    pub medications: Vec<Medication>,
    pub diagnoses: Vec<Diagnosis>,
    pub test_results: Vec<TestResult>,
    /// Only present when requested and returned.
    pub subject: Option<SubjectAttributes>,
    /// Why the response yielded less than it should have.
    pub diagnostic: Option<String>,
}

impl PageExtraction {
    /// The result used when the response is unusable.
    pub fn unparseable(reason: impl Into<String>) -> Self {
        Self {
            categories: vec![ExtractedCategory {
                label: CategoryLabel::Other,
                justification: UNPARSEABLE_JUSTIFICATION.to_string(),
            }],
            diagnostic: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn fact_count(&self) -> usize {
        self.medications.len() + self.diagnoses.len() + self.test_results.len()
    }

    pub fn labels(&self) -> Vec<CategoryLabel> {
        self.categories.iter().map(|c| c.label).collect()
    }
}

// ── Wire shape ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawResponse {
    categories: Vec<RawCategory>,
    #[serde(alias = "medication")]
    medications: Vec<Medication>,
    #[serde(alias = "diagnosis", alias = "conditions")]
    diagnoses: Vec<Diagnosis>,
    #[serde(alias = "tests", alias = "lab_results")]
    test_results: Vec<TestResult>,
    #[serde(alias = "patient")]
    subject: Option<SubjectAttributes>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCategory {
    Label(String),
    Tagged(TaggedCategory),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TaggedCategory {
    #[serde(alias = "category", alias = "label")]
    name: String,
    #[serde(alias = "justification", alias = "reasoning")]
    reason: String,
}

// ── Cleanup rules ────────────────────────────────────────────────────────

static RE_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n?(.*?)\n?```\s*$").unwrap());

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{00AD}'))
        .collect()
}

fn strip_fences(input: &str) -> String {
    let trimmed = input.trim();
    match RE_FENCES.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

/// Cut the outermost `{ … }` out of surrounding prose.
fn outermost_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    (end > start).then(|| &input[start..=end])
}

// ── Mapping ──────────────────────────────────────────────────────────────

fn map_categories(raw: Vec<RawCategory>) -> Vec<ExtractedCategory> {
    let mut out: Vec<ExtractedCategory> = Vec::new();
    for item in raw {
        let (name, reason) = match item {
            RawCategory::Label(name) => (name, String::new()),
            RawCategory::Tagged(t) => (t.name, t.reason),
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let reason = reason.trim();
        let (label, justification) = match CategoryLabel::parse(name) {
            Some(label) => (label, reason.to_string()),
            // Keep the model's own label so nothing is lost.
            None if reason.is_empty() => (CategoryLabel::Other, name.to_string()),
            None => (CategoryLabel::Other, format!("{name}: {reason}")),
        };
        if out.iter().any(|c| c.label == label) {
            continue;
        }
        out.push(ExtractedCategory {
            label,
            justification,
        });
    }
    out
}

/// Parse a model response. Never fails.
pub fn parse_response(text: &str) -> PageExtraction {
    let cleaned = strip_fences(&remove_invisible_chars(text));
    let Some(json) = outermost_object(&cleaned) else {
        warn!("model response contains no JSON object ({} chars)", text.len());
        return PageExtraction::unparseable("response contained no JSON object");
    };

    let raw: RawResponse = match serde_json::from_str(json) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("model response is not valid JSON: {}", e);
            return PageExtraction::unparseable(format!("response is not valid JSON: {e}"));
        }
    };

    let medications: Vec<Medication> = raw.medications.into_iter().filter(|m| m.name.is_known()).collect();
    let diagnoses: Vec<Diagnosis> = raw
        .diagnoses
        .into_iter()
        .filter(|d| d.description.is_known() || d.code.is_known())
        .collect();
    let test_results: Vec<TestResult> = raw.test_results.into_iter().filter(|t| t.name.is_known()).collect();

    let mut categories = map_categories(raw.categories);
    let mut diagnostic = None;
    if categories.is_empty() {
        categories.push(ExtractedCategory {
            label: CategoryLabel::Other,
            justification: "No category assigned".to_string(),
        });
        diagnostic = Some("response assigned no category".to_string());
    }

    debug!(
        "parsed response: {} categories, {} medications, {} diagnoses, {} test results",
        categories.len(),
        medications.len(),
        diagnoses.len(),
        test_results.len()
    );

    PageExtraction {
        categories,
        medications,
        diagnoses,
        test_results,
        subject: raw.subject,
        diagnostic,
    }
}
