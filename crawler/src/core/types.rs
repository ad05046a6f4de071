//! Shared deterministic types for the crawler core.
//!
//! These types define stable contracts between the loop, its bookkeeping
//! components and the collaborators. They carry no I/O and serialize to the
//! same shape the event sinks and stores expect.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned identifier of a visually distinct screen.
pub type ScreenId = u64;

/// Interaction kinds the oracle may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Input,
    LongPress,
    ScrollUp,
    ScrollDown,
    ScrollLeft,
    ScrollRight,
    Back,
    ExtractOtp,
    ClickVerificationLink,
}

impl ActionKind {
    pub const ALL: [ActionKind; 10] = [
        ActionKind::Click,
        ActionKind::Input,
        ActionKind::LongPress,
        ActionKind::ScrollUp,
        ActionKind::ScrollDown,
        ActionKind::ScrollLeft,
        ActionKind::ScrollRight,
        ActionKind::Back,
        ActionKind::ExtractOtp,
        ActionKind::ClickVerificationLink,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Input => "input",
            ActionKind::LongPress => "long_press",
            ActionKind::ScrollUp => "scroll_up",
            ActionKind::ScrollDown => "scroll_down",
            ActionKind::ScrollLeft => "scroll_left",
            ActionKind::ScrollRight => "scroll_right",
            ActionKind::Back => "back",
            ActionKind::ExtractOtp => "extract_otp",
            ActionKind::ClickVerificationLink => "click_verification_link",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
    }

    /// Kinds that act on a specific on-screen element.
    pub fn requires_target(self) -> bool {
        matches!(
            self,
            ActionKind::Click | ActionKind::Input | ActionKind::LongPress | ActionKind::ExtractOtp
        )
    }

    pub fn takes_input_text(self) -> bool {
        self == ActionKind::Input
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Axis-aligned element bounds as `[x, y]` corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top_left: [i32; 2],
    pub bottom_right: [i32; 2],
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            top_left: [x1, y1],
            bottom_right: [x2, y2],
        }
    }

    /// `bottom_right` must lie strictly below and to the right of `top_left`.
    pub fn is_well_formed(&self) -> bool {
        self.top_left[0] >= 0
            && self.top_left[1] >= 0
            && self.bottom_right[0] > self.top_left[0]
            && self.bottom_right[1] > self.top_left[1]
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.top_left[0] + self.bottom_right[0]) / 2,
            (self.top_left[1] + self.bottom_right[1]) / 2,
        )
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{}]-[{},{}]",
            self.top_left[0], self.top_left[1], self.bottom_right[0], self.bottom_right[1]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    pub fn center(&self) -> Point {
        Point::new(to_coord(self.width / 2), to_coord(self.height / 2))
    }

    /// Point at the given fraction of width/height.
    pub fn at(&self, fx: f64, fy: f64) -> Point {
        Point::new(
            to_coord((f64::from(self.width) * fx).round() as u32),
            to_coord((f64::from(self.height) * fy).round() as u32),
        )
    }
}

fn to_coord(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// A validated action with its target already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub target: Option<BoundingBox>,
    /// Grounding label the oracle referred to, kept for history rendering.
    pub label: Option<String>,
    pub input_text: Option<String>,
    pub rationale: String,
}

/// Outcome of executing one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub action: ActionKind,
    /// Human-readable description of what was acted upon.
    pub target: String,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub navigated_away: bool,
}

impl ActionResult {
    pub fn succeeded(action: ActionKind, target: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            action,
            target: target.into(),
            duration_ms,
            error: None,
            navigated_away: false,
        }
    }

    pub fn failed(
        action: ActionKind,
        target: impl Into<String>,
        duration_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            action,
            target: target.into(),
            duration_ms,
            error: Some(error.into()),
            navigated_away: false,
        }
    }
}

/// Operator intent, owned by the run controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Running,
    Paused,
    Stopped,
}

/// Actual phase of a run, owned by the lifecycle machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Running,
    PausedManual,
    Stopping,
    Stopped,
    Error,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 7] = [
        LifecycleState::Uninitialized,
        LifecycleState::Initializing,
        LifecycleState::Running,
        LifecycleState::PausedManual,
        LifecycleState::Stopping,
        LifecycleState::Stopped,
        LifecycleState::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Running => "running",
            LifecycleState::PausedManual => "paused_manual",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Error)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted status of a crawl run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One exploration session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlRun {
    pub id: String,
    pub device_id: String,
    pub target_package: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub step_count: u32,
    pub screen_count: u32,
}

impl CrawlRun {
    pub fn pending(id: &str, device_id: &str, target_package: &str) -> Self {
        Self {
            id: id.to_string(),
            device_id: device_id.to_string(),
            target_package: target_package.to_string(),
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
            step_count: 0,
            screen_count: 0,
        }
    }
}

/// A visually distinct application state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screen {
    pub id: ScreenId,
    pub fingerprint: String,
    pub screenshot_path: Option<String>,
    pub activity: Option<String>,
    pub first_seen_run: String,
    pub first_seen_step: u32,
}

/// Fields needed to create a [`Screen`]; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewScreen {
    pub fingerprint: String,
    pub screenshot_path: Option<String>,
    pub activity: Option<String>,
    pub first_seen_run: String,
    pub first_seen_step: u32,
}

/// Result of processing one captured screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenObservation {
    pub screen_id: ScreenId,
    pub is_new: bool,
    pub visit_count: u32,
    pub total_screens: u32,
}

/// Persisted record of a completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub step: u32,
    pub screen_id: ScreenId,
    pub actions: Vec<Action>,
    pub results: Vec<ActionResult>,
    pub duration_ms: u64,
    pub stuck: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_parse_accepts_wire_names() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActionKind::parse(" Scroll_Down "), Some(ActionKind::ScrollDown));
        assert_eq!(ActionKind::parse("swipe"), None);
    }

    #[test]
    fn bounding_box_center_and_shape() {
        let bbox = BoundingBox::new(10, 20, 110, 220);
        assert!(bbox.is_well_formed());
        assert_eq!(bbox.center(), Point::new(60, 120));
        assert!(!BoundingBox::new(50, 50, 50, 80).is_well_formed());
        assert!(!BoundingBox::new(-1, 0, 10, 10).is_well_formed());
    }

    #[test]
    fn action_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ActionKind::ClickVerificationLink).expect("serialize");
        assert_eq!(json, "\"click_verification_link\"");
    }
}
