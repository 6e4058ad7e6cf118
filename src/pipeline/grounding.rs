use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::sources::SourceFact;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub content: String,
}

/// A key figure is either a number, which must be cited, or a short text
/// such as a trend label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FigureValue {
    Number(f64),
    Text(String),
}

impl FigureValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FigureValue::Number(n) => Some(*n),
            FigureValue::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyNumber {
    pub label: String,
    pub value: Option<FigureValue>,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub citation_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub id: String,
    pub title: String,
    pub url: String,
}

impl From<&SourceFact> for Citation {
    fn from(fact: &SourceFact) -> Self {
        Self {
            id: fact.id.clone(),
            title: fact.title.clone(),
            url: fact.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsRef {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExpertOpinion {
    pub price_background: String,
    pub risk_factors: String,
    pub outlook: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Swot {
    pub strength: String,
    pub weakness: String,
    pub opportunity: String,
    pub threat: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MarketInsight {
    pub keywords: Vec<String>,
    pub keyword_context: Option<String>,
    pub news: Vec<NewsRef>,
    pub expert_opinion: ExpertOpinion,
    pub swot: Swot,
}

/// Structured narrative report. `citations` always lists every supplied fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDraft {
    pub summary: String,
    pub sections: Vec<Section>,
    pub key_numbers: Vec<KeyNumber>,
    #[serde(default)]
    pub cautions: Vec<String>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_insight: Option<MarketInsight>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("response is not valid JSON: {0}")]
    Unparseable(String),

    #[error("report shape is invalid: {0}")]
    InvalidShape(String),

    #[error("key number {label:?} has a numeric value but no citation")]
    MissingCitation { label: String },

    #[error("key number {label:?} cites unknown source {id:?}")]
    UnknownCitation { label: String, id: String },
}

impl ValidationFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationFailure::Unparseable(_) => "unparseable",
            ValidationFailure::InvalidShape(_) => "invalid_shape",
            ValidationFailure::MissingCitation { .. } => "missing_citation",
            ValidationFailure::UnknownCitation { .. } => "unknown_citation",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Valid(ReportDraft),
    Invalid(ValidationFailure),
}

/// Pulls the JSON object out of a completion: a ```json fence first, then a
/// bare fence holding an object, then the first balanced `{...}` block.
pub fn extract_json(content: &str) -> Option<&str> {
    if let Some(start) = content.find("```json")
        && let Some(end) = content[start + 7..].find("```")
    {
        return Some(content[start + 7..start + 7 + end].trim());
    }
    if let Some(start) = content.find("```")
        && let Some(end) = content[start + 3..].find("```")
    {
        let inner = content[start + 3..start + 3 + end].trim();
        if inner.starts_with('{') {
            return Some(inner);
        }
    }
    first_balanced_object(content)
}

fn first_balanced_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in content[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Accepts a completion only if it parses into a report whose numeric key
/// numbers all cite facts and whose citations all resolve. Text values may
/// go uncited. On success the citations are replaced by
/// the full fact list.
pub fn validate_report(raw: &str, facts: &[SourceFact]) -> Validation {
    let Some(json) = extract_json(raw) else {
        return Validation::Invalid(ValidationFailure::Unparseable(
            "no JSON object found".to_string(),
        ));
    };

    let value: serde_json::Value = match serde_json::from_str(json) {
        Ok(value) => value,
        Err(e) => return Validation::Invalid(ValidationFailure::Unparseable(e.to_string())),
    };

    let mut report: ReportDraft = match serde_json::from_value(value) {
        Ok(report) => report,
        Err(e) => return Validation::Invalid(ValidationFailure::InvalidShape(e.to_string())),
    };

    if report.summary.trim().is_empty() {
        return Validation::Invalid(ValidationFailure::InvalidShape(
            "summary is empty".to_string(),
        ));
    }

    if let Err(failure) = check_citations(&report.key_numbers, facts) {
        return Validation::Invalid(failure);
    }

    report.citations = full_citations(facts);
    Validation::Valid(report)
}

pub(crate) fn check_citations(
    key_numbers: &[KeyNumber],
    facts: &[SourceFact],
) -> Result<(), ValidationFailure> {
    let known: HashSet<&str> = facts.iter().map(|f| f.id.as_str()).collect();

    for key in key_numbers {
        let numeric = key.value.as_ref().and_then(FigureValue::as_number).is_some();
        if numeric && key.citation_ids.is_empty() {
            return Err(ValidationFailure::MissingCitation {
                label: key.label.clone(),
            });
        }
        if let Some(id) = key.citation_ids.iter().find(|id| !known.contains(id.as_str())) {
            return Err(ValidationFailure::UnknownCitation {
                label: key.label.clone(),
                id: id.clone(),
            });
        }
    }
    Ok(())
}

pub(crate) fn full_citations(facts: &[SourceFact]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    facts
        .iter()
        .filter(|f| !f.id.is_empty() && seen.insert(f.id.as_str()))
        .map(Citation::from)
        .collect()
}
