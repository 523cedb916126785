//! Evaluator verdicts: parsing the model's JSON report and deciding readiness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletenessBreakdown {
    #[serde(default)]
    pub core_identity: f32,
    #[serde(default)]
    pub personality_traits: f32,
    #[serde(default)]
    pub behavioral_patterns: f32,
    #[serde(default)]
    pub interaction_patterns: f32,
}

impl CompletenessBreakdown {
    fn clamped(self) -> Self {
        let c = |v: f32| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            core_identity: c(self.core_identity),
            personality_traits: c(self.personality_traits),
            behavioral_patterns: c(self.behavioral_patterns),
            interaction_patterns: c(self.interaction_patterns),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub critique: String,
    #[serde(default)]
    pub is_ready_for_writing: bool,
    #[serde(default)]
    pub extracted_traits: Vec<String>,
    #[serde(default)]
    pub extracted_keywords: Vec<String>,
    #[serde(default, alias = "completeness_data")]
    pub completeness_breakdown: CompletenessBreakdown,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default = "Utc::now")]
    pub evaluated_at: DateTime<Utc>,
    /// Set when the evaluator call itself failed; the critique holds the error.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    /// Profile revision (trait line count) this verdict was computed for.
    #[serde(default)]
    pub revision: u64,
}

impl Evaluation {
    /// Parse the evaluator's reply. Markdown fences and chatter around the
    /// JSON object are ignored; the score is clamped to 0..=10.
    pub fn parse(text: &str) -> Result<Self> {
        let cleaned = text.trim().replace("```json", "").replace("```", "");
        let start = cleaned.find('{');
        let end = cleaned.rfind('}');
        let json = match (start, end) {
            (Some(s), Some(e)) if s < e => &cleaned[s..=e],
            _ => return Err(Error::Parse(format!("no JSON object in evaluator reply: {}", preview(text)))),
        };

        let mut evaluation: Evaluation = serde_json::from_str(json)
            .map_err(|e| Error::Parse(format!("invalid evaluator JSON ({e}): {}", preview(json))))?;
        evaluation.failed = false;
        evaluation.score = evaluation
            .score
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(0.0, 10.0));
        evaluation.completeness_breakdown = evaluation.completeness_breakdown.clamped();
        evaluation.critique = evaluation.critique.trim().to_string();
        Ok(evaluation)
    }

    /// A not-ready verdict that carries an error message as critique.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            score: None,
            critique: message.into(),
            is_ready_for_writing: false,
            extracted_traits: Vec::new(),
            extracted_keywords: Vec::new(),
            completeness_breakdown: CompletenessBreakdown::default(),
            suggestions: Vec::new(),
            evaluated_at: Utc::now(),
            failed: true,
            revision: 0,
        }
    }

    /// Ready when the model says so, or when the score reaches `threshold`.
    pub fn is_ready(&self, threshold: f32) -> bool {
        self.is_ready_for_writing || self.score.map_or(false, |s| s >= threshold)
    }
}

fn preview(text: &str) -> String {
    let mut p: String = text.chars().take(120).collect();
    if text.chars().count() > 120 {
        p.push_str("...");
    }
    p
}
