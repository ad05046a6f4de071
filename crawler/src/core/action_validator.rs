//! Semantic validation of oracle responses.
//!
//! Structural checks (JSON shape, field types) happen against the response
//! schema before this module runs. Here the rules that need context are
//! enforced: action count, required targets, label resolution against the
//! grounding overlay, and which kinds may carry input text. Every violation is
//! collected so a retry log shows the full picture.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{Action, ActionKind, BoundingBox};

pub const MIN_ACTIONS: usize = 1;
pub const MAX_ACTIONS: usize = 12;

/// Grounding label -> element bounds.
pub type LabelMap = HashMap<String, BoundingBox>;

/// Oracle response as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleResponse {
    pub actions: Vec<RawAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAction {
    pub action: String,
    #[serde(default)]
    pub target_bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub target_label: Option<String>,
    #[serde(default)]
    pub input_text: Option<String>,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid oracle response: {}", .messages.join("; "))]
pub struct ValidationError {
    pub messages: Vec<String>,
}

/// Explicit bounding box first, then the label lookup.
pub fn resolve_target(raw: &RawAction, labels: &LabelMap) -> Option<BoundingBox> {
    if let Some(bbox) = raw.target_bounding_box {
        return Some(bbox);
    }
    raw.target_label
        .as_deref()
        .and_then(|label| labels.get(normalize_label(label)))
        .copied()
}

fn normalize_label(label: &str) -> &str {
    label
        .trim()
        .trim_start_matches(['[', '#'])
        .trim_end_matches(']')
        .trim()
}

pub fn validate_actions(
    raw: &[RawAction],
    labels: &LabelMap,
) -> Result<Vec<Action>, ValidationError> {
    let mut messages = Vec::new();
    if raw.len() < MIN_ACTIONS || raw.len() > MAX_ACTIONS {
        messages.push(format!(
            "expected between {MIN_ACTIONS} and {MAX_ACTIONS} actions, got {}",
            raw.len()
        ));
    }

    let mut actions = Vec::with_capacity(raw.len());
    for (index, item) in raw.iter().enumerate() {
        match validate_one(index, item, labels) {
            Ok(action) => actions.push(action),
            Err(mut errors) => messages.append(&mut errors),
        }
    }

    if messages.is_empty() {
        Ok(actions)
    } else {
        Err(ValidationError { messages })
    }
}

fn validate_one(index: usize, raw: &RawAction, labels: &LabelMap) -> Result<Action, Vec<String>> {
    let Some(kind) = ActionKind::parse(&raw.action) else {
        return Err(vec![format!("action {index}: unknown kind '{}'", raw.action)]);
    };

    let mut errors = Vec::new();
    let target = resolve_target(raw, labels);

    if let Some(bbox) = raw.target_bounding_box
        && !bbox.is_well_formed()
    {
        errors.push(format!("action {index} ({kind}): malformed bounding box {bbox}"));
    }

    if kind.requires_target() && target.is_none() {
        match raw.target_label.as_deref() {
            Some(label) => errors.push(format!(
                "action {index} ({kind}): target_label '{label}' not found in grounding overlay"
            )),
            None => errors.push(format!(
                "action {index} ({kind}): target_bounding_box or target_label required"
            )),
        }
    }

    let text = raw.input_text.as_deref().map(str::trim).filter(|t| !t.is_empty());
    if kind.takes_input_text() && text.is_none() {
        errors.push(format!("action {index} ({kind}): input_text required"));
    }
    if !kind.takes_input_text() && text.is_some() {
        errors.push(format!(
            "action {index} ({kind}): input_text only allowed for input actions"
        ));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(Action {
        kind,
        target: if kind.requires_target() { target } else { None },
        label: raw.target_label.clone(),
        input_text: raw.input_text.clone().filter(|_| kind.takes_input_text()),
        rationale: raw.reasoning.clone(),
    })
}
