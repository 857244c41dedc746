//! Strict response shape for the LLM analyzer. Anything that does not
//! parse into [`AnalysisVerdict`] with every required field present and in
//! range is a schema violation, triggering one narrowed repair attempt
//! before the stage degrades.

use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::types::{RiskLevel, SearchHit, SecurityEvent};

/// Input handed to an analyzer: the event in canonical form plus its
/// vector-search neighbors as context.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub event: SecurityEvent,
    pub neighbors: Vec<SearchHit>,
    /// Second attempt with a narrowed, schema-only prompt
    pub narrowed: bool,
}

impl AnalysisRequest {
    pub fn new(event: SecurityEvent, neighbors: Vec<SearchHit>) -> Self {
        Self {
            event,
            neighbors,
            narrowed: false,
        }
    }

    pub fn narrowed(mut self) -> Self {
        self.narrowed = true;
        self
    }

    /// Canonical prompt text; also the cache-key input.
    pub fn prompt(&self) -> String {
        let neighbors: Vec<String> = self
            .neighbors
            .iter()
            .map(|hit| {
                format!(
                    "- id={} similarity={:.2} risk={} type={}",
                    hit.id,
                    hit.similarity,
                    hit.metadata.get("risk_level").map(String::as_str).unwrap_or("?"),
                    hit.metadata.get("event_type").map(String::as_str).unwrap_or("?"),
                )
            })
            .collect();

        let schema_clause = if self.narrowed {
            "Respond with ONLY the JSON object, no prose, no code fences. \
             Every field is required."
        } else {
            "Respond with a single JSON object."
        };

        format!(
            "You are a security analyst classifying one host event.\n\
             Event: {}\n\
             Similar past events:\n{}\n\
             {}\n\
             JSON schema: {{\"risk_level\": \"critical|high|medium|low\", \
             \"confidence\": 0-100, \"threat_classification\": string, \
             \"mitre_techniques\": [string], \"recommended_actions\": [string], \
             \"reasoning\": string}}",
            self.event.canonical_text(),
            if neighbors.is_empty() {
                "(none)".to_string()
            } else {
                neighbors.join("\n")
            },
            schema_clause,
        )
    }
}

/// Strictly-shaped analyzer output.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AnalysisVerdict {
    pub risk_level: RiskLevel,
    pub confidence: u8,
    pub threat_classification: String,
    pub mitre_techniques: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub reasoning: String,
}

/// Parse raw model output into a verdict, tolerating code fences but
/// nothing else.
pub fn parse_verdict(content: &str) -> Result<AnalysisVerdict> {
    let trimmed = strip_fences(content);

    let value: serde_json::Value = serde_json::from_str(trimmed).map_err(|e| {
        Error::new(
            ErrorCode::LlmSchemaViolation,
            format!("analyzer output is not JSON: {}", e),
        )
    })?;

    let object = value.as_object().ok_or_else(|| {
        Error::new(ErrorCode::LlmSchemaViolation, "analyzer output is not an object")
    })?;

    let risk_level = object
        .get("risk_level")
        .and_then(|v| v.as_str())
        .and_then(RiskLevel::parse)
        .ok_or_else(|| schema_violation("risk_level"))?;

    let confidence = object
        .get("confidence")
        .and_then(|v| v.as_u64())
        .filter(|c| *c <= 100)
        .ok_or_else(|| schema_violation("confidence"))? as u8;

    let threat_classification = object
        .get("threat_classification")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| schema_violation("threat_classification"))?
        .to_string();

    let mitre_techniques = string_array(object.get("mitre_techniques"))
        .ok_or_else(|| schema_violation("mitre_techniques"))?;
    let recommended_actions = string_array(object.get("recommended_actions"))
        .ok_or_else(|| schema_violation("recommended_actions"))?;

    let reasoning = object
        .get("reasoning")
        .and_then(|v| v.as_str())
        .ok_or_else(|| schema_violation("reasoning"))?
        .to_string();

    Ok(AnalysisVerdict {
        risk_level,
        confidence,
        threat_classification,
        mitre_techniques,
        recommended_actions,
        reasoning,
    })
}

fn schema_violation(field: &str) -> Error {
    Error::new(
        ErrorCode::LlmSchemaViolation,
        format!("analyzer output missing or invalid field '{}'", field),
    )
}

fn string_array(value: Option<&serde_json::Value>) -> Option<Vec<String>> {
    value?.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect()
    })
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "risk_level": "high",
        "confidence": 85,
        "threat_classification": "credential_access",
        "mitre_techniques": ["T1110.001"],
        "recommended_actions": ["Block source address"],
        "reasoning": "Burst of failed logons against one account."
    }"#;

    #[test]
    fn valid_output_parses() {
        let verdict = parse_verdict(VALID).unwrap();
        assert_eq!(verdict.risk_level, RiskLevel::High);
        assert_eq!(verdict.confidence, 85);
        assert_eq!(verdict.mitre_techniques, vec!["T1110.001"]);
    }

    #[test]
    fn fenced_output_parses() {
        let fenced = format!("```json\n{}\n```", VALID);
        assert!(parse_verdict(&fenced).is_ok());
    }

    #[test]
    fn missing_field_is_schema_violation() {
        let missing = r#"{"risk_level": "high", "confidence": 85}"#;
        let err = parse_verdict(missing).unwrap_err();
        assert_eq!(err.code, ErrorCode::LlmSchemaViolation);
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let bad = VALID.replace("85", "150");
        let err = parse_verdict(&bad).unwrap_err();
        assert_eq!(err.code, ErrorCode::LlmSchemaViolation);
    }

    #[test]
    fn unknown_risk_level_is_rejected() {
        let bad = VALID.replace("\"high\"", "\"severe\"");
        let err = parse_verdict(&bad).unwrap_err();
        assert_eq!(err.code, ErrorCode::LlmSchemaViolation);
    }

    #[test]
    fn prose_is_rejected() {
        let err = parse_verdict("The event looks risky.").unwrap_err();
        assert_eq!(err.code, ErrorCode::LlmSchemaViolation);
    }
}
