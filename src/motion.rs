//! Motion and action types buffered by the action queue (§3 `MotionBuffer`,
//! §4.6).

use crate::value::{Pose, Value};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionSettings {
    pub velocity: f64,
    pub acceleration: f64,
    pub blending: f64,
}

impl MotionSettings {
    /// Field-name to store-variable-name mapping, matching the reference
    /// implementation's `MotionSettings.field_to_varname` convention used by
    /// the generated settings-modifier builtins (§6.2). `blending` is
    /// special-cased: the reference implementation names the underlying
    /// motion-buffer field `position_zone_radius`, not `blending`.
    pub fn varname(field: &str) -> String {
        match field {
            "blending" => "__ms_position_zone_radius".to_owned(),
            _ => format!("__ms_{field}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionKind {
    Ptp,
    JointPtp,
    Linear,
    Arc,
    Spline,
}

#[derive(Debug, Clone)]
pub struct Motion {
    pub kind: MotionKind,
    pub target: Pose,
    pub settings: MotionSettings,
}

#[derive(Debug, Clone)]
pub enum ActionKind {
    Write { device_id: String, key: String, value: Value },
    Read { device_id: String, key: String },
    ReadPose { device_id: String },
    ReadJoints { device_id: String },
    Call { device_id: String, key: String, args: Vec<Value> },
}

#[derive(Debug, Clone)]
pub struct ActionContainer {
    pub action: ActionKind,
    /// `None` means "fires at trajectory start" (§4.6 `attach_action`).
    pub path_parameter: Option<f64>,
}

/// A motion group's pending buffer: ordered motions plus attached actions,
/// in the insertion order required by §5's ordering guarantees.
#[derive(Debug, Clone, Default)]
pub struct CombinedActions {
    pub motions: Vec<Motion>,
    pub actions: Vec<ActionContainer>,
}

impl CombinedActions {
    pub fn is_empty(&self) -> bool {
        self.motions.is_empty() && self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.motions.len()
    }
}

/// One emitted sample along a planned trajectory, matching the reference
/// implementation's `MotionState`.
#[derive(Debug, Clone)]
pub struct MotionState {
    pub motion_group_id: String,
    pub path_parameter: f64,
    pub pose: Pose,
    pub joints: Vec<f64>,
}
