//! Program run state machine (component H, §4.7), grounded on the reference
//! implementation's `ProgramRunner`/`ProgramRun`: parse once, then drive
//! evaluation on a dedicated `tokio::task::LocalSet` so `Rc`-based scopes
//! never need to cross a thread boundary, while a sibling task watches for
//! an externally requested stop and trips the evaluator's cooperative
//! `StopToken`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::LocalSet;

use crate::action_queue::StopToken;
use crate::error::{Signal, Unwind};
use crate::evaluator::{Ctx, Evaluator};
use crate::parser::parse_program;
use crate::robot_cell::RobotCell;
use crate::serializer::store_to_json;
use crate::store::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramRunState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub state: ProgramRunState,
    pub stdout: String,
    pub store: serde_json::Value,
    pub error: Option<String>,
}

/// Owns a single program execution: the source, the collaborator cell, and
/// the result once `run` has completed. Mirrors `ProgramRun`'s role as the
/// unit the CLI/process shell (§6.4) reports on.
pub struct ProgramRun {
    source: String,
    cell: Arc<dyn RobotCell>,
    state: Mutex<ProgramRunState>,
    stop_requested: Arc<AtomicBool>,
}

impl ProgramRun {
    pub fn new(source: String, cell: Arc<dyn RobotCell>) -> Self {
        ProgramRun { source, cell, state: Mutex::new(ProgramRunState::NotStarted), stop_requested: Arc::new(AtomicBool::new(false)) }
    }

    pub fn state(&self) -> ProgramRunState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProgramRunState::Running
    }

    /// Requests a stop; the running program notices at its next sync point,
    /// same as the reference implementation's cooperative cancellation (no
    /// hard task abort).
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub async fn run(&self) -> ExecutionResult {
        *self.state.lock().unwrap() = ProgramRunState::Running;
        let _ = self.cell.open().await;

        let program = match parse_program(&self.source) {
            Ok(p) => p,
            Err(e) => {
                *self.state.lock().unwrap() = ProgramRunState::Failed;
                return ExecutionResult { state: ProgramRunState::Failed, stdout: String::new(), store: serde_json::Value::Null, error: Some(e.to_string()) };
            }
        };

        let evaluator = Evaluator::new(self.cell.clone());
        let stop_requested = self.stop_requested.clone();
        let stop_token = evaluator.stop.clone();

        let local = LocalSet::new();
        let eval_handle = evaluator.clone();
        let watcher = local.spawn_local(Self::watch_for_stop(stop_requested, stop_token));
        let (outcome, store) = local
            .run_until(async move {
                let scope = Scope::root();
                let ctx = Ctx::root(scope.clone());
                let outcome = eval_handle.eval_block(&ctx, &program.body).await;
                (outcome, store_to_json(&scope.visible_entries()))
            })
            .await;
        watcher.abort();

        let _ = self.cell.close().await;
        let stdout = evaluator.take_stdout();

        let (state, error) = match outcome {
            Ok(()) => (ProgramRunState::Completed, None),
            Err(Unwind::Signal(Signal::Termination)) => (ProgramRunState::Stopped, None),
            Err(Unwind::Signal(_)) => (ProgramRunState::Completed, None),
            Err(Unwind::Error(e)) => (ProgramRunState::Failed, Some(e.to_string())),
        };
        *self.state.lock().unwrap() = state;
        ExecutionResult { state, stdout, store, error }
    }

    /// Polls for an externally requested stop and trips the cooperative
    /// token the evaluator checks at every action-queue drain.
    async fn watch_for_stop(stop_requested: Arc<AtomicBool>, stop_token: StopToken) {
        loop {
            if stop_requested.load(Ordering::SeqCst) {
                stop_token.stop();
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robot_cell::SimulatedRobotCell;

    #[tokio::test]
    async fn completes_a_simple_program() {
        let run = ProgramRun::new("a = 1 + 2\nprint(a)\n".to_owned(), Arc::new(SimulatedRobotCell::new()));
        let result = run.run().await;
        assert_eq!(result.state, ProgramRunState::Completed);
        assert_eq!(result.stdout, "3\n");
    }

    #[tokio::test]
    async fn raise_fails_the_run_with_message() {
        let run = ProgramRun::new("raise \"boom\"\n".to_owned(), Arc::new(SimulatedRobotCell::new()));
        let result = run.run().await;
        assert_eq!(result.state, ProgramRunState::Failed);
        assert!(result.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn syntax_error_fails_before_running() {
        let run = ProgramRun::new("a = (\n".to_owned(), Arc::new(SimulatedRobotCell::new()));
        let result = run.run().await;
        assert_eq!(result.state, ProgramRunState::Failed);
    }

    #[tokio::test]
    async fn store_is_reported_after_completion() {
        let run = ProgramRun::new("a = 42\n".to_owned(), Arc::new(SimulatedRobotCell::new()));
        let result = run.run().await;
        assert_eq!(result.store["a"], serde_json::json!(42));
    }
}
