//! Per-robot motion buffer, planner invocation, path-parameter triggers and
//! merging (component G, §4.6). Grounded directly on the reference
//! implementation's `ActionQueue`/`PlannableActionQueue`/`Store.get_motion_settings`
//! trio, translated from its thread/generator-based asyncio plumbing into a
//! `tokio` task group per §5 and §9's "cooperative cancellation token" note.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::error::WandelscriptError;
use crate::motion::{ActionContainer, ActionKind, CombinedActions, Motion, MotionState};
use crate::robot_cell::RobotCell;
use crate::value::Value;

pub const MOTION_LIMIT_IN: usize = 10_000;

/// Executes one already-queued action immediately against its device,
/// mirroring `run_action`'s `@singledispatch` handlers.
async fn run_action(action: &ActionKind, cell: &dyn RobotCell) -> Result<Value, WandelscriptError> {
    match action {
        ActionKind::Write { device_id, key, value } => {
            let device = cell.get_device(device_id).ok_or_else(|| WandelscriptError::configuration(format!("unknown device '{device_id}'")))?;
            device.write(key, value.clone()).await?;
            Ok(Value::Bool(true))
        }
        ActionKind::Read { device_id, key } => {
            let device = cell.get_device(device_id).ok_or_else(|| WandelscriptError::configuration(format!("unknown device '{device_id}'")))?;
            device.read(key).await
        }
        ActionKind::ReadPose { device_id } => {
            let robot = cell.get_robot(device_id).ok_or_else(|| WandelscriptError::wrong_robot(None, format!("unknown robot '{device_id}'")))?;
            let tcp = robot.active_tcp_name().await?;
            let (pose, _joints) = robot.get_state(&tcp).await?;
            Ok(Value::Pose(pose))
        }
        ActionKind::ReadJoints { device_id } => {
            let robot = cell.get_robot(device_id).ok_or_else(|| WandelscriptError::wrong_robot(None, format!("unknown robot '{device_id}'")))?;
            let tcp = robot.active_tcp_name().await?;
            let (_pose, joints) = robot.get_state(&tcp).await?;
            Ok(Value::Tuple(joints.into_iter().map(Value::Float).collect()))
        }
        ActionKind::Call { device_id, key, args } => {
            let device = cell.get_device(device_id).ok_or_else(|| WandelscriptError::configuration(format!("unknown device '{device_id}'")))?;
            device.call(key, args).await
        }
    }
}

#[derive(Clone)]
pub struct StopToken {
    notify: Arc<Notify>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        StopToken { notify: Arc::new(Notify::new()), stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)) }
    }

    pub fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt callbacks run inline inside `ActionQueue::run`'s own task, never
/// spawned onto another thread — the evaluator is single-threaded cooperative
/// (§9), so these close over `Rc`-based scopes without needing `Send`.
pub type InterruptCallback = Rc<dyn Fn(&MotionState) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()>>>>;

/// Whether action execution is allowed at all; `PlannableActionQueue` flips
/// this to reject every side effect except reads from a designated
/// configuration device (§4.6).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Full,
    PlanOnly,
}

pub struct ActionQueue {
    mode: QueueMode,
    motion_limit_in: usize,
    motion_limit_out: Option<usize>,
    tcp: HashMap<String, String>,
    record: HashMap<String, CombinedActions>,
    last_motions: HashMap<String, Motion>,
    path_history: Vec<CombinedActions>,
    interrupt_callbacks: HashMap<String, InterruptCallback>,
    config_device_id: Option<String>,
}

impl ActionQueue {
    pub fn new() -> Self {
        ActionQueue {
            mode: QueueMode::Full,
            motion_limit_in: MOTION_LIMIT_IN,
            motion_limit_out: None,
            tcp: HashMap::new(),
            record: HashMap::new(),
            last_motions: HashMap::new(),
            path_history: Vec::new(),
            interrupt_callbacks: HashMap::new(),
            config_device_id: None,
        }
    }

    /// §4.6: the plan-only variant used behind a `/plan/`-style endpoint,
    /// with tighter limits and every side effect rejected except reads from
    /// `config_device_id`.
    pub fn plannable(config_device_id: Option<String>) -> Self {
        ActionQueue {
            mode: QueueMode::PlanOnly,
            motion_limit_in: 1_000,
            motion_limit_out: Some(1_000),
            tcp: HashMap::new(),
            record: HashMap::new(),
            last_motions: HashMap::new(),
            path_history: Vec::new(),
            interrupt_callbacks: HashMap::new(),
            config_device_id,
        }
    }

    pub fn reset(&mut self) {
        self.tcp.clear();
        self.record.clear();
        self.path_history.clear();
        self.interrupt_callbacks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.record.values().all(|c| c.is_empty())
    }

    pub fn register_interrupt(&mut self, name: String, callback: InterruptCallback) {
        self.interrupt_callbacks.insert(name, callback);
    }

    pub fn unregister_interrupt(&mut self, name: &str) {
        self.interrupt_callbacks.remove(name);
    }

    pub fn last_pose(&self, motion_group_id: &str) -> Option<crate::value::Pose> {
        self.last_motions.get(motion_group_id).map(|m| m.target)
    }

    pub fn attach_action(&mut self, action: ActionKind, motion_group_id: &str) {
        self.record.entry(motion_group_id.to_owned()).or_default().actions.push(ActionContainer { action, path_parameter: None });
    }

    /// Executes an action immediately, enforcing the plan-only restriction of
    /// §4.6 when applicable.
    pub async fn run_action_now(&self, action: &ActionKind, cell: &dyn RobotCell) -> Result<Value, WandelscriptError> {
        if self.mode == QueueMode::PlanOnly {
            let allowed = matches!(action, ActionKind::Read { device_id, .. } if Some(device_id.as_str()) == self.config_device_id.as_deref());
            if !allowed {
                return Err(WandelscriptError::not_plannable(
                    None,
                    "Actions are not supported in the plan endpoint to avoid critical side effects.",
                ));
            }
        }
        run_action(action, cell).await
    }

    pub fn push(&mut self, motions: Vec<Motion>, tool: Option<&str>, motion_group_id: &str) -> Result<(), WandelscriptError> {
        if let Some(tool) = tool {
            match self.tcp.get(motion_group_id) {
                None => {
                    self.tcp.insert(motion_group_id.to_owned(), tool.to_owned());
                }
                Some(existing) if existing != tool => {
                    return Err(WandelscriptError::motion(
                        None,
                        format!("Changing the tcp in one motion is not supported: changed from {existing} to {tool}"),
                    ));
                }
                _ => {}
            }
        }
        let buffer = self.record.entry(motion_group_id.to_owned()).or_default();
        for motion in motions {
            if buffer.motions.len() >= self.motion_limit_in {
                return Err(WandelscriptError::motion(None, "Maximum motion queue size exceeded. Won't plan skill."));
            }
            buffer.motions.push(motion.clone());
            self.last_motions.insert(motion_group_id.to_owned(), motion);
        }
        Ok(())
    }

    fn record_history(&mut self, trajectory: CombinedActions) -> Result<(), WandelscriptError> {
        self.path_history.push(trajectory);
        if let Some(limit) = self.motion_limit_out {
            if self.path_history.len() > limit {
                return Err(WandelscriptError::motion(None, "Maximum motion queue size exceeded. Won't plan skill."));
            }
        }
        Ok(())
    }

    /// Drains the queue (§4.6 algorithm): plans+streams every non-empty
    /// motion buffer concurrently, merges the resulting state streams, fires
    /// interrupts and path-parameter actions per state, and runs
    /// motion-less buffers' actions immediately in order.
    pub async fn run(
        &mut self,
        cell: &dyn RobotCell,
        stop: &StopToken,
        debug: bool,
    ) -> Result<HashMap<String, Vec<MotionState>>, WandelscriptError> {
        let mut recordings: HashMap<String, Vec<MotionState>> = HashMap::new();
        let groups: Vec<String> = self.record.keys().cloned().collect();
        let mut receivers: Vec<mpsc::Receiver<MotionState>> = Vec::new();
        let mut pending_actions: HashMap<String, Vec<ActionContainer>> = HashMap::new();

        for motion_group_id in &groups {
            let buffer = self.record.get(motion_group_id).cloned().unwrap_or_default();
            if buffer.motions.is_empty() {
                for container in &buffer.actions {
                    self.run_action_now(&container.action, cell).await?;
                }
                continue;
            }
            if debug {
                self.record_history(buffer.clone())?;
            }
            let robot = cell
                .get_robot(motion_group_id)
                .ok_or_else(|| WandelscriptError::wrong_robot(None, format!("unknown robot '{motion_group_id}'")))?;
            let tool = match self.tcp.get(motion_group_id) {
                Some(t) => t.clone(),
                None => robot.active_tcp_name().await?,
            };
            let trajectory = robot.plan(&buffer, &tool).await?;
            let receiver = robot.stream_execute(trajectory, &tool).await?;
            receivers.push(receiver);
            let mut actions = buffer.actions.clone();
            actions.sort_by(|a, b| {
                a.path_parameter.unwrap_or(0.0).partial_cmp(&b.path_parameter.unwrap_or(0.0)).unwrap()
            });
            pending_actions.insert(motion_group_id.clone(), actions);
        }

        // Fair-merge all per-robot streams into one sequence of states,
        // triggering interrupts/actions and recording as each arrives.
        let mut merged = MergedStreams::new(receivers);
        while let Some(state) = merged.next().await {
            if stop.is_stopped() {
                cell.stop().await?;
                break;
            }
            for callback in self.interrupt_callbacks.values() {
                callback(&state).await;
            }
            if let Some(actions) = pending_actions.get_mut(&state.motion_group_id) {
                let mut fired = 0;
                for container in actions.iter() {
                    if container.path_parameter.unwrap_or(0.0) <= state.path_parameter {
                        self.run_action_now(&container.action, cell).await?;
                        fired += 1;
                    } else {
                        break;
                    }
                }
                actions.drain(0..fired);
            }
            recordings.entry(state.motion_group_id.clone()).or_default().push(state);
        }

        self.record.clear();
        self.tcp.clear();
        Ok(recordings)
    }
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Fair interleaving of several `MotionState` receivers, polled round-robin
/// so no single robot's stream starves the others (§4.6 step 3).
struct MergedStreams {
    receivers: Vec<mpsc::Receiver<MotionState>>,
    cursor: usize,
}

impl MergedStreams {
    fn new(receivers: Vec<mpsc::Receiver<MotionState>>) -> Self {
        MergedStreams { receivers, cursor: 0 }
    }

    async fn next(&mut self) -> Option<MotionState> {
        if self.receivers.is_empty() {
            return None;
        }
        let n = self.receivers.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            match self.receivers[idx].try_recv() {
                Ok(state) => {
                    self.cursor = (idx + 1) % n;
                    return Some(state);
                }
                Err(mpsc::error::TryRecvError::Empty) => continue,
                Err(mpsc::error::TryRecvError::Disconnected) => continue,
            }
        }
        // Nothing ready right now: await the first receiver to produce or
        // close, then retry — this keeps the merge cooperative rather than
        // busy-looping.
        let mut any_open = false;
        for receiver in self.receivers.iter_mut() {
            if let Some(state) = receiver.recv().await {
                any_open = true;
                return Some(state);
            }
        }
        if any_open {
            self.next_boxed().await
        } else {
            None
        }
    }

    fn next_boxed<'a>(&'a mut self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<MotionState>> + 'a>> {
        Box::pin(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::{MotionKind, MotionSettings};
    use crate::value::{Pose, Vector3};

    fn motion() -> Motion {
        Motion { kind: MotionKind::Linear, target: Pose::new(Vector3::new(1.0, 0.0, 0.0), Vector3::zero()), settings: MotionSettings::default() }
    }

    #[test]
    fn push_enforces_fixed_tool() {
        let mut queue = ActionQueue::new();
        queue.push(vec![motion()], Some("flange"), "robot").unwrap();
        let err = queue.push(vec![motion()], Some("gripper"), "robot");
        assert!(err.is_err());
    }

    #[test]
    fn last_pose_tracks_most_recent_push() {
        let mut queue = ActionQueue::new();
        queue.push(vec![motion()], Some("flange"), "robot").unwrap();
        assert_eq!(queue.last_pose("robot"), Some(motion().target));
    }

    #[tokio::test]
    async fn plannable_queue_rejects_side_effects() {
        let queue = ActionQueue::plannable(None);
        let cell = crate::robot_cell::SimulatedRobotCell::new().with_device("io");
        let result = queue
            .run_action_now(&ActionKind::Write { device_id: "io".to_owned(), key: "x".to_owned(), value: Value::Bool(true) }, &cell)
            .await;
        assert!(result.is_err());
    }
}
