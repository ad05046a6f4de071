//! Oracle seam and response validation.
//!
//! The [`Oracle`] trait hides the model call; it returns the raw JSON the
//! model produced. [`ResponseValidator`] checks that JSON against the embedded
//! response schema (Draft 2020-12) and then applies the semantic rules in
//! [`crate::core::action_validator`]. Both stages report through
//! [`ValidationError`] so the step treats them like a transport failure.

use std::path::PathBuf;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde::Serialize;
use serde_json::Value;

use crate::core::action_validator::{LabelMap, OracleResponse, ValidationError, validate_actions};
use crate::core::types::Action;
use crate::io::grounding::GroundedElement;

const RESPONSE_SCHEMA: &str = include_str!("../../schemas/oracle_response.schema.json");

/// Everything the oracle is told about the current step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleContext {
    pub run_id: String,
    pub step: u32,
    pub target_package: String,
    pub screenshot_path: PathBuf,
    pub annotated_path: Option<PathBuf>,
    pub elements: Vec<GroundedElement>,
    /// Rendered exploration history.
    pub history: String,
    pub is_new_screen: bool,
    pub visit_count: u32,
    pub total_screens: u32,
    pub stuck: bool,
    pub stuck_reason: Option<String>,
    /// 1-based attempt number within this step.
    pub attempt: u32,
    /// Why the previous attempt was rejected, fed back on retry.
    pub previous_error: Option<String>,
}

pub trait Oracle: Send + Sync {
    fn next_actions(&self, context: &OracleContext) -> Result<Value>;
}

pub struct ResponseValidator {
    schema: Validator,
}

impl ResponseValidator {
    pub fn new() -> Result<Self> {
        let schema: Value =
            serde_json::from_str(RESPONSE_SCHEMA).context("parse oracle response schema")?;
        let schema = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .context("compile oracle response schema")?;
        Ok(Self { schema })
    }

    /// Schema check, then semantic validation against the grounding labels.
    pub fn validate(&self, raw: &Value, labels: &LabelMap) -> Result<Vec<Action>, ValidationError> {
        let messages: Vec<String> = self
            .schema
            .iter_errors(raw)
            .map(|err| format!("schema: {err}"))
            .collect();
        if !messages.is_empty() {
            return Err(ValidationError { messages });
        }
        let response: OracleResponse =
            serde_json::from_value(raw.clone()).map_err(|err| ValidationError {
                messages: vec![format!("deserialize: {err}")],
            })?;
        validate_actions(&response.actions, labels)
    }
}
