//! Visual grounding seam: screenshot in, labeled elements out.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::action_validator::LabelMap;
use crate::core::types::BoundingBox;

/// One detected, labeled element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundedElement {
    /// Label drawn on the annotated overlay, referenced by the oracle.
    pub label: String,
    pub text: Option<String>,
    pub bounds: BoundingBox,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingResult {
    pub elements: Vec<GroundedElement>,
    pub label_map: LabelMap,
    pub annotated_path: Option<PathBuf>,
}

impl GroundingResult {
    /// Build the label map from `elements`; a repeated label keeps its first box.
    pub fn from_elements(elements: Vec<GroundedElement>, annotated_path: Option<PathBuf>) -> Self {
        let mut label_map = LabelMap::new();
        for element in &elements {
            label_map
                .entry(element.label.clone())
                .or_insert(element.bounds);
        }
        Self {
            elements,
            label_map,
            annotated_path,
        }
    }
}

pub trait Grounding: Send + Sync {
    fn process(&self, screenshot: &Path) -> Result<GroundingResult>;
}
