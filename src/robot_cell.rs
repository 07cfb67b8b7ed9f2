//! Collaborator traits the core depends on (§6.3): `RobotCell`, `Robot`,
//! `ForeignFunction`. These are narrow contracts only — the core never ships
//! a production device driver. `SimulatedRobotCell` is the one concrete,
//! in-process implementation the crate carries, used by the test suite and
//! by the CLI when no external API is configured (§6.4).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::WandelscriptError;
use crate::motion::{CombinedActions, MotionState};
use crate::value::{Pose, Value, Vector3};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyState {
    Normal,
    Reduced,
    Stopped,
}

impl SafetyState {
    pub fn is_operational(&self) -> bool {
        matches!(self, SafetyState::Normal | SafetyState::Reduced)
    }
}

#[async_trait]
pub trait Device: Send + Sync {
    async fn read(&self, key: &str) -> Result<Value, WandelscriptError>;
    async fn write(&self, key: &str, value: Value) -> Result<(), WandelscriptError>;
    async fn call(&self, key: &str, args: &[Value]) -> Result<Value, WandelscriptError>;
}

#[async_trait]
pub trait Robot: Send + Sync {
    fn motion_group_id(&self) -> &str;
    async fn active_tcp_name(&self) -> Result<String, WandelscriptError>;
    async fn tcps(&self) -> Result<Vec<String>, WandelscriptError>;
    async fn get_state(&self, tcp: &str) -> Result<(Pose, Vec<f64>), WandelscriptError>;
    /// Plans `motions` against the named `tool`, returning an opaque
    /// trajectory handle that `stream_execute` consumes.
    async fn plan(&self, motions: &CombinedActions, tool: &str) -> Result<Trajectory, WandelscriptError>;
    /// Streams `MotionState`s for a previously planned trajectory.
    async fn stream_execute(&self, trajectory: Trajectory, tool: &str) -> Result<mpsc::Receiver<MotionState>, WandelscriptError>;
}

#[derive(Debug, Clone)]
pub struct Trajectory {
    pub motion_group_id: String,
    pub waypoints: Vec<Pose>,
}

#[async_trait]
pub trait RobotCell: Send + Sync {
    async fn open(&self) -> Result<(), WandelscriptError>;
    async fn close(&self) -> Result<(), WandelscriptError>;
    fn get_robot_ids(&self) -> Vec<String>;
    fn get_robot(&self, id: &str) -> Option<std::sync::Arc<dyn Robot>>;
    fn get_device(&self, id: &str) -> Option<std::sync::Arc<dyn Device>>;
    /// Safety-state stream for the E-stop monitor (§4.7); a simple polling
    /// channel is enough for the core's purposes.
    async fn state_stream(&self) -> mpsc::Receiver<SafetyState>;
    async fn stop(&self) -> Result<(), WandelscriptError>;
}

/// A callable supplied from outside the language core (§6.3, §9): a name,
/// whether the evaluator should pass the execution context as a first
/// argument, and a conversion table applied to arguments/results.
#[async_trait]
pub trait ForeignFunction: Send + Sync {
    fn name(&self) -> &str;
    fn pass_context(&self) -> bool;
    async fn call(&self, args: Vec<Value>) -> Result<Value, WandelscriptError>;
}

// ---------------------------------------------------------------------
// SimulatedRobotCell: the one in-process implementation the crate ships.
// ---------------------------------------------------------------------

pub struct SimulatedDevice {
    store: Mutex<HashMap<String, Value>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        SimulatedDevice { store: Mutex::new(HashMap::new()) }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for SimulatedDevice {
    async fn read(&self, key: &str) -> Result<Value, WandelscriptError> {
        let store = self.store.lock().unwrap();
        Ok(store.get(key).cloned().unwrap_or(Value::Bool(false)))
    }

    async fn write(&self, key: &str, value: Value) -> Result<(), WandelscriptError> {
        self.store.lock().unwrap().insert(key.to_owned(), value);
        Ok(())
    }

    async fn call(&self, _key: &str, args: &[Value]) -> Result<Value, WandelscriptError> {
        Ok(args.first().cloned().unwrap_or(Value::Bool(true)))
    }
}

/// A single simulated motion group that plans straight-line trajectories
/// between waypoints and "executes" them instantaneously, sampling a handful
/// of intermediate `MotionState`s so path-parameter-triggered actions still
/// have something to trigger against.
pub struct SimulatedRobot {
    id: String,
    current_pose: Mutex<Pose>,
    tcp: Mutex<String>,
}

impl SimulatedRobot {
    pub fn new(id: impl Into<String>) -> Self {
        SimulatedRobot { id: id.into(), current_pose: Mutex::new(Pose::identity()), tcp: Mutex::new("flange".to_owned()) }
    }
}

#[async_trait]
impl Robot for SimulatedRobot {
    fn motion_group_id(&self) -> &str {
        &self.id
    }

    async fn active_tcp_name(&self) -> Result<String, WandelscriptError> {
        Ok(self.tcp.lock().unwrap().clone())
    }

    async fn tcps(&self) -> Result<Vec<String>, WandelscriptError> {
        Ok(vec!["flange".to_owned()])
    }

    async fn get_state(&self, _tcp: &str) -> Result<(Pose, Vec<f64>), WandelscriptError> {
        Ok((*self.current_pose.lock().unwrap(), vec![0.0; 6]))
    }

    async fn plan(&self, motions: &CombinedActions, _tool: &str) -> Result<Trajectory, WandelscriptError> {
        if motions.len() > 10_000 {
            return Err(WandelscriptError::motion(None, "Maximum motion queue size exceeded. Won't plan skill."));
        }
        let mut waypoints = vec![*self.current_pose.lock().unwrap()];
        waypoints.extend(motions.motions.iter().map(|m| m.target));
        Ok(Trajectory { motion_group_id: self.id.clone(), waypoints })
    }

    async fn stream_execute(&self, trajectory: Trajectory, _tool: &str) -> Result<mpsc::Receiver<MotionState>, WandelscriptError> {
        let (tx, rx) = mpsc::channel(64);
        let id = self.id.clone();
        let segments = trajectory.waypoints.len().saturating_sub(1).max(1) as f64;
        let last_pose = *trajectory.waypoints.last().unwrap_or(&Pose::identity());
        *self.current_pose.lock().unwrap() = last_pose;
        tokio::spawn(async move {
            for (index, window) in trajectory.waypoints.windows(2).enumerate() {
                let (start, end) = (window[0], window[1]);
                for step in 0..=3 {
                    let t = step as f64 / 3.0;
                    let pose = start.interpolate(end, t);
                    let path_parameter = (index as f64 + t) / segments;
                    let state = MotionState { motion_group_id: id.clone(), path_parameter, pose, joints: vec![0.0; 6] };
                    if tx.send(state).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

pub struct SimulatedRobotCell {
    robots: HashMap<String, std::sync::Arc<dyn Robot>>,
    devices: HashMap<String, std::sync::Arc<dyn Device>>,
    safety_state: Mutex<SafetyState>,
}

impl SimulatedRobotCell {
    pub fn new() -> Self {
        let mut robots: HashMap<String, std::sync::Arc<dyn Robot>> = HashMap::new();
        robots.insert("robot".to_owned(), std::sync::Arc::new(SimulatedRobot::new("robot")));
        SimulatedRobotCell { robots, devices: HashMap::new(), safety_state: Mutex::new(SafetyState::Normal) }
    }

    pub fn with_device(mut self, id: impl Into<String>) -> Self {
        self.devices.insert(id.into(), std::sync::Arc::new(SimulatedDevice::new()));
        self
    }
}

impl Default for SimulatedRobotCell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RobotCell for SimulatedRobotCell {
    async fn open(&self) -> Result<(), WandelscriptError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), WandelscriptError> {
        Ok(())
    }

    fn get_robot_ids(&self) -> Vec<String> {
        self.robots.keys().cloned().collect()
    }

    fn get_robot(&self, id: &str) -> Option<std::sync::Arc<dyn Robot>> {
        self.robots.get(id).cloned()
    }

    fn get_device(&self, id: &str) -> Option<std::sync::Arc<dyn Device>> {
        self.devices.get(id).cloned()
    }

    async fn state_stream(&self) -> mpsc::Receiver<SafetyState> {
        let (tx, rx) = mpsc::channel(1);
        let state = *self.safety_state.lock().unwrap();
        let _ = tx.try_send(state);
        rx
    }

    async fn stop(&self) -> Result<(), WandelscriptError> {
        Ok(())
    }
}

pub fn default_vector3_pose(v: Vector3) -> Pose {
    Pose::new(v, Vector3::zero())
}
