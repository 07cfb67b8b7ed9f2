//! The tree-walking evaluator (component F, §4.4/§4.5), grounded on the
//! reference implementation's `Interpreter.visit_*` dispatch: one method per
//! statement/expression shape, threaded through a `Store` scope chain and an
//! `ActionQueue`. Recursion goes through boxed futures since `async fn` can't
//! call itself directly.
//!
//! Single-threaded cooperative model (§9): everything here runs inside one
//! `tokio::task::LocalSet` task (see `runner.rs`), so scopes and closures are
//! plain `Rc`, not `Arc` — there is never a second thread to race with.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use crate::action_queue::{ActionQueue, InterruptCallback, StopToken};
use crate::ast::{AssignTarget, BinOp, Block, Connector, Expr, ExprKind, MoveDefParam, Statement, StatementKind, UnOp};
use crate::builtins::{self, call_builtin, BuiltinContext};
use crate::error::{EvalResult, SourceRange, Signal, Unwind, WandelscriptError};
use crate::motion::{ActionKind, Motion, MotionKind, MotionSettings};
use crate::robot_cell::RobotCell;
use crate::store::Scope;
use crate::value::{Closure, Device, Frame, Pose, PoseChainLink, Record, Value, Vector3};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// A lightweight, per-call evaluation context: the active scope, which
/// motion group new `Move`s attach to, and whether we're nested inside a
/// `do with ...:` arm (where an explicit `sync` is a `NestedSyncError`, §7).
#[derive(Clone)]
pub struct Ctx {
    pub scope: Rc<Scope>,
    pub motion_group_id: String,
    pub in_robot_block: bool,
}

impl Ctx {
    pub fn root(scope: Rc<Scope>) -> Self {
        Ctx { scope, motion_group_id: "robot".to_owned(), in_robot_block: false }
    }

    fn with_scope(&self, scope: Rc<Scope>) -> Ctx {
        Ctx { scope, motion_group_id: self.motion_group_id.clone(), in_robot_block: self.in_robot_block }
    }
}

type InterruptDef = (Expr, Block, Rc<Scope>);

/// Everything the evaluator needs to run a program, cheap to clone (every
/// field is an `Rc`/`Arc` handle) so interrupt callbacks can own a copy
/// without borrowing from the call stack that registered them.
#[derive(Clone)]
pub struct Evaluator {
    pub cell: Arc<dyn RobotCell>,
    pub action_queue: Rc<RefCell<ActionQueue>>,
    pub stdout: Rc<RefCell<String>>,
    pub stop: StopToken,
    pub interrupts: Rc<RefCell<HashMap<String, InterruptDef>>>,
    pub debug: bool,
}

impl Evaluator {
    pub fn new(cell: Arc<dyn RobotCell>) -> Self {
        Evaluator {
            cell,
            action_queue: Rc::new(RefCell::new(ActionQueue::new())),
            stdout: Rc::new(RefCell::new(String::new())),
            stop: StopToken::new(),
            interrupts: Rc::new(RefCell::new(HashMap::new())),
            debug: false,
        }
    }

    pub fn take_stdout(&self) -> String {
        std::mem::take(&mut *self.stdout.borrow_mut())
    }

    async fn drain(&self, range: SourceRange) -> EvalResult<()> {
        let mut queue = self.action_queue.borrow_mut();
        queue.run(self.cell.as_ref(), &self.stop, self.debug).await.map_err(|e| match e {
            WandelscriptError::Motion { message, .. } => WandelscriptError::Motion { location: Some(range), message },
            other => other,
        })?;
        Ok(())
    }

    fn builtin_ctx<'a>(&'a self, ctx: &'a Ctx) -> BuiltinContext<'a> {
        BuiltinContext { scope: &ctx.scope, action_queue: &self.action_queue, cell: self.cell.as_ref(), stdout: &self.stdout, motion_group_id: &ctx.motion_group_id }
    }

    // ---- blocks / statements -------------------------------------------

    pub fn eval_block<'a>(&'a self, ctx: &'a Ctx, block: &'a Block) -> BoxFuture<'a, EvalResult<()>> {
        Box::pin(async move {
            for stmt in block {
                self.eval_statement(ctx, stmt).await?;
            }
            Ok(())
        })
    }

    pub fn eval_statement<'a>(&'a self, ctx: &'a Ctx, stmt: &'a Statement) -> BoxFuture<'a, EvalResult<()>> {
        Box::pin(async move {
            match &stmt.kind {
                StatementKind::Expression(expr) => {
                    self.eval_expr(ctx, expr).await?;
                    Ok(())
                }
                StatementKind::Assignment { targets, value } => self.eval_assignment(ctx, targets, value).await,
                StatementKind::FrameRelationAssignment { target, source, value } => {
                    let target_name = self.frame_expr_name(ctx, target).await?;
                    let source_name = self.frame_expr_name(ctx, source).await?;
                    let pose = self.eval_expr(ctx, value).await?.as_pose().ok_or_else(|| -> Unwind {
                        WandelscriptError::ty(value.range, "frame relation value must be a pose").into()
                    })?;
                    ctx.scope.frame_graph.borrow_mut().set_relation(&target_name, &source_name, pose);
                    Ok(())
                }
                StatementKind::Move { frame, connector, target, modifiers } => self.eval_move(ctx, stmt.range, frame.as_deref(), connector, target, modifiers).await,
                StatementKind::Wait { duration } => {
                    let secs = self.eval_expr(ctx, duration).await?.as_float().ok_or_else(|| -> Unwind {
                        WandelscriptError::ty(duration.range, "wait() duration must be a number").into()
                    })?;
                    tokio::time::sleep(std::time::Duration::from_secs_f64(secs.max(0.0))).await;
                    Ok(())
                }
                StatementKind::Raise { value } => {
                    let message = builtins::display_value(&self.eval_expr(ctx, value).await?);
                    Err(WandelscriptError::user(Some(stmt.range), message).into())
                }
                StatementKind::Break => Err(Signal::Break.into()),
                StatementKind::Return { value } => {
                    let result = match value {
                        Some(expr) => self.eval_expr(ctx, expr).await?,
                        None => Value::Tuple(Vec::new()),
                    };
                    Err(Signal::Return(result).into())
                }
                StatementKind::Stop => Err(Signal::Termination.into()),
                StatementKind::Pass => Ok(()),
                StatementKind::Print { value } => {
                    let rendered = builtins::display_value(&self.eval_expr(ctx, value).await?);
                    self.stdout.borrow_mut().push_str(&rendered);
                    self.stdout.borrow_mut().push('\n');
                    Ok(())
                }
                StatementKind::Write { device, key, value } => {
                    let device_id = self.expect_device_id(ctx, device).await?;
                    let key = self.expect_string_value(ctx, key).await?;
                    let value = self.eval_expr(ctx, value).await?;
                    self.action_queue
                        .borrow()
                        .run_action_now(&ActionKind::Write { device_id, key, value }, self.cell.as_ref())
                        .await
                        .map_err(Unwind::from)?;
                    Ok(())
                }
                StatementKind::CallStatement { device, key, args } => {
                    let device_id = self.expect_device_id(ctx, device).await?;
                    let key = self.expect_string_value(ctx, key).await?;
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval_expr(ctx, arg).await?);
                    }
                    self.action_queue
                        .borrow()
                        .run_action_now(&ActionKind::Call { device_id, key, args: values }, self.cell.as_ref())
                        .await
                        .map_err(Unwind::from)?;
                    Ok(())
                }
                StatementKind::If { branches, else_block } => {
                    for (cond, body) in branches {
                        if self.eval_expr(ctx, cond).await?.is_truthy() {
                            let child = Scope::descend(&ctx.scope).map_err(Unwind::from)?;
                            return self.eval_block(&ctx.with_scope(child), body).await;
                        }
                    }
                    if let Some(body) = else_block {
                        let child = Scope::descend(&ctx.scope).map_err(Unwind::from)?;
                        return self.eval_block(&ctx.with_scope(child), body).await;
                    }
                    Ok(())
                }
                StatementKind::For { var, start, end, inclusive, body } => {
                    let start_v = self.eval_expr(ctx, start).await?.as_float().ok_or_else(|| -> Unwind {
                        WandelscriptError::ty(start.range, "for loop bounds must be numbers").into()
                    })? as i64;
                    let end_v = self.eval_expr(ctx, end).await?.as_float().ok_or_else(|| -> Unwind {
                        WandelscriptError::ty(end.range, "for loop bounds must be numbers").into()
                    })? as i64;
                    let last = if *inclusive { end_v } else { end_v - 1 };
                    let child = Scope::descend(&ctx.scope).map_err(Unwind::from)?;
                    let loop_ctx = ctx.with_scope(child);
                    let mut i = start_v;
                    while i <= last {
                        loop_ctx.scope.bind_local(var, Value::Int(i));
                        match self.eval_block(&loop_ctx, body).await {
                            Ok(()) => {}
                            Err(Unwind::Signal(Signal::Break)) => break,
                            other => return other,
                        }
                        i += 1;
                    }
                    Ok(())
                }
                StatementKind::While { condition, body } => {
                    let child = Scope::descend(&ctx.scope).map_err(Unwind::from)?;
                    let loop_ctx = ctx.with_scope(child);
                    while self.eval_expr(&loop_ctx, condition).await?.is_truthy() {
                        match self.eval_block(&loop_ctx, body).await {
                            Ok(()) => {}
                            Err(Unwind::Signal(Signal::Break)) => break,
                            other => return other,
                        }
                    }
                    Ok(())
                }
                StatementKind::Repeat { count, body } => {
                    let n = self.eval_expr(ctx, count).await?.as_float().ok_or_else(|| -> Unwind {
                        WandelscriptError::ty(count.range, "repeat() count must be a number").into()
                    })? as i64;
                    let child = Scope::descend(&ctx.scope).map_err(Unwind::from)?;
                    let loop_ctx = ctx.with_scope(child);
                    for _ in 0..n.max(0) {
                        match self.eval_block(&loop_ctx, body).await {
                            Ok(()) => {}
                            Err(Unwind::Signal(Signal::Break)) => break,
                            other => return other,
                        }
                    }
                    Ok(())
                }
                StatementKind::Switch { value, cases, default } => {
                    let subject = self.eval_expr(ctx, value).await?;
                    for (case_value, body) in cases {
                        let candidate = self.eval_expr(ctx, case_value).await?;
                        if candidate == subject {
                            let child = Scope::descend(&ctx.scope).map_err(Unwind::from)?;
                            return self.eval_block(&ctx.with_scope(child), body).await;
                        }
                    }
                    if let Some(body) = default {
                        let child = Scope::descend(&ctx.scope).map_err(Unwind::from)?;
                        return self.eval_block(&ctx.with_scope(child), body).await;
                    }
                    Ok(())
                }
                StatementKind::FunctionDef { name, params, body } => {
                    let closure =
                        Closure { scope: ctx.scope.clone(), params: params.clone(), body: Rc::new(body.clone()), pose_chain: Vec::new(), bound_connector: None };
                    ctx.scope.bind_local(name, Value::Closure(Rc::new(closure)));
                    Ok(())
                }
                StatementKind::MoveDef { name, params, body } => {
                    let mut value_params = Vec::new();
                    let mut bound_connector = None;
                    for param in params {
                        match param {
                            MoveDefParam::Value(p) => value_params.push(p.clone()),
                            MoveDefParam::Connector { start, end } => bound_connector = Some((start.clone(), end.clone())),
                        }
                    }
                    let closure = Closure { scope: ctx.scope.clone(), params: value_params, body: Rc::new(body.clone()), pose_chain: Vec::new(), bound_connector };
                    ctx.scope.bind_local(name, Value::Closure(Rc::new(closure)));
                    Ok(())
                }
                StatementKind::Interrupt { name, when, body } => {
                    self.interrupts.borrow_mut().insert(name.clone(), (when.clone(), body.clone(), ctx.scope.clone()));
                    Ok(())
                }
                StatementKind::Activate { name } => self.activate_interrupt(name, stmt.range),
                StatementKind::Deactivate { name } => {
                    self.action_queue.borrow_mut().unregister_interrupt(name);
                    Ok(())
                }
                StatementKind::WithContext { modifiers, body } => {
                    let child = Scope::descend(&ctx.scope).map_err(Unwind::from)?;
                    for modifier_expr in modifiers {
                        let value = self.eval_expr(ctx, modifier_expr).await?;
                        match value {
                            Value::Record(record) if builtins::is_modifier(&record) => {
                                let varname = builtins::modifier_varname(&record).ok_or_else(|| -> Unwind {
                                    WandelscriptError::ty(modifier_expr.range, "malformed modifier").into()
                                })?;
                                let value = builtins::modifier_value(&record).unwrap_or(Value::Bool(true));
                                child.bind_local(&varname, value);
                            }
                            other => {
                                return Err(WandelscriptError::ty(modifier_expr.range, format!("expected a context modifier, found {}", other.type_name())).into());
                            }
                        }
                    }
                    self.eval_block(&ctx.with_scope(child), body).await
                }
                StatementKind::SyncBlock { body, sync_then, except } => self.eval_sync_block(ctx, stmt.range, body.as_ref(), sync_then.as_ref(), except.as_ref()).await,
                StatementKind::Sync => {
                    if ctx.in_robot_block {
                        return Err(WandelscriptError::nested_sync(stmt.range).into());
                    }
                    self.drain(stmt.range).await
                }
                StatementKind::RobotBlock { arms } => self.eval_robot_block(ctx, stmt.range, arms).await,
            }
        })
    }

    async fn eval_assignment(&self, ctx: &Ctx, targets: &[AssignTarget], value: &Expr) -> EvalResult<()> {
        let result = self.eval_expr(ctx, value).await?;
        if targets.len() == 1 {
            let AssignTarget::Name(name) = &targets[0];
            ctx.scope.set(name, result);
            return Ok(());
        }
        match result {
            Value::Tuple(items) if items.len() == targets.len() => {
                for (target, item) in targets.iter().zip(items.into_iter()) {
                    let AssignTarget::Name(name) = target;
                    ctx.scope.set(name, item);
                }
                Ok(())
            }
            other => Err(WandelscriptError::ty(value.range, format!("cannot unpack {} into {} names", other.type_name(), targets.len())).into()),
        }
    }

    async fn eval_move(&self, ctx: &Ctx, range: SourceRange, frame: Option<&str>, connector: &Connector, target: &Expr, modifiers: &[Expr]) -> EvalResult<()> {
        if let Some(Value::Closure(closure)) = ctx.scope.get(&connector.name) {
            if let Some((start_name, end_name)) = closure.bound_connector.clone() {
                return self.eval_bound_connector_move(ctx, range, frame, connector, &closure, &start_name, &end_name, target).await;
            }
        }
        let kind = match connector.name.as_str() {
            "ptp" => MotionKind::Ptp,
            "joint_ptp" => MotionKind::JointPtp,
            "line" | "linear" => MotionKind::Linear,
            "arc" => MotionKind::Arc,
            "spline" => MotionKind::Spline,
            other => return Err(WandelscriptError::motion(Some(range), format!("unknown motion connector '{other}'")).into()),
        };
        let mut target_pose = self.eval_expr(ctx, target).await?.as_pose().ok_or_else(|| -> Unwind {
            WandelscriptError::ty(target.range, "move target must be a pose").into()
        })?;
        if let Some(frame_name) = frame {
            let transform = ctx.scope.frame_graph.borrow().eval(&ctx.scope.flange.name, frame_name).map_err(Unwind::from)?;
            target_pose = transform.compose(target_pose);
        }
        let (mut settings, mut tool) = self.ambient_settings(ctx);
        for modifier_expr in modifiers {
            let value = self.eval_expr(ctx, modifier_expr).await?;
            match value {
                Value::Record(record) if builtins::is_modifier(&record) => self.apply_modifier(&mut settings, &mut tool, &record, modifier_expr.range)?,
                other => return Err(WandelscriptError::ty(modifier_expr.range, format!("expected a motion modifier, found {}", other.type_name())).into()),
            }
        }
        let motion = Motion { kind, target: target_pose, settings };
        self.action_queue.borrow_mut().push(vec![motion], tool.as_deref(), &ctx.motion_group_id).map_err(Unwind::from)?;
        Ok(())
    }

    /// Invokes a `moveDef name(start >--> end):` connector (§4.1): binds
    /// `start`/`end` to the motion group's last planned pose and this move's
    /// target, then runs the connector body, whose own `move` statements
    /// enqueue their motions in place of a single builtin motion.
    #[allow(clippy::too_many_arguments)]
    async fn eval_bound_connector_move(
        &self,
        ctx: &Ctx,
        range: SourceRange,
        frame: Option<&str>,
        connector: &Connector,
        closure: &Rc<Closure>,
        start_name: &str,
        end_name: &str,
        target: &Expr,
    ) -> EvalResult<()> {
        let mut target_pose = self.eval_expr(ctx, target).await?.as_pose().ok_or_else(|| -> Unwind {
            WandelscriptError::ty(target.range, "move target must be a pose").into()
        })?;
        if let Some(frame_name) = frame {
            let transform = ctx.scope.frame_graph.borrow().eval(&ctx.scope.flange.name, frame_name).map_err(Unwind::from)?;
            target_pose = transform.compose(target_pose);
        }
        let start_pose = self.action_queue.borrow().last_pose(&ctx.motion_group_id).unwrap_or(target_pose);
        if connector.args.len() != closure.params.len() {
            return Err(WandelscriptError::ty(range, format!("expected {} argument(s), got {}", closure.params.len(), connector.args.len())).into());
        }
        let mut args = Vec::with_capacity(connector.args.len());
        for arg in &connector.args {
            args.push(self.eval_expr(ctx, arg).await?);
        }
        let child = Scope::descend(&closure.scope).map_err(Unwind::from)?;
        for (param, value) in closure.params.iter().zip(args.into_iter()) {
            child.bind_local(param, value);
        }
        child.bind_local(start_name, Value::Pose(start_pose));
        child.bind_local(end_name, Value::Pose(target_pose));
        let call_ctx = ctx.with_scope(child);
        match self.eval_block(&call_ctx, &closure.body).await {
            Ok(()) => Ok(()),
            Err(Unwind::Signal(Signal::Return(_))) => Ok(()),
            Err(other) => Err(other),
        }
    }

    fn ambient_settings(&self, ctx: &Ctx) -> (MotionSettings, Option<String>) {
        let mut settings = MotionSettings::default();
        if let Some(v) = ctx.scope.get(&MotionSettings::varname("velocity")).and_then(|v| v.as_float()) {
            settings.velocity = v;
        }
        if let Some(v) = ctx.scope.get(&MotionSettings::varname("acceleration")).and_then(|v| v.as_float()) {
            settings.acceleration = v;
        }
        if let Some(v) = ctx.scope.get(&MotionSettings::varname("blending")).and_then(|v| v.as_float()) {
            settings.blending = v;
        }
        let tool = match ctx.scope.get(&MotionSettings::varname("tcp")) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        (settings, tool)
    }

    fn apply_modifier(&self, settings: &mut MotionSettings, tool: &mut Option<String>, record: &Record, range: SourceRange) -> EvalResult<()> {
        let varname = builtins::modifier_varname(record).ok_or_else(|| -> Unwind { WandelscriptError::ty(range, "malformed modifier").into() })?;
        let value = builtins::modifier_value(record).unwrap_or(Value::Bool(true));
        if varname == MotionSettings::varname("velocity") {
            settings.velocity = value.as_float().unwrap_or(settings.velocity);
        } else if varname == MotionSettings::varname("acceleration") {
            settings.acceleration = value.as_float().unwrap_or(settings.acceleration);
        } else if varname == MotionSettings::varname("blending") {
            settings.blending = value.as_float().unwrap_or(settings.blending);
        } else if varname == MotionSettings::varname("tcp") {
            if let Value::String(s) = value {
                *tool = Some(s);
            }
        }
        Ok(())
    }

    async fn eval_sync_block(&self, ctx: &Ctx, range: SourceRange, body: Option<&Block>, sync_then: Option<&Block>, except: Option<&Block>) -> EvalResult<()> {
        if ctx.in_robot_block && (body.is_some() || sync_then.is_some()) {
            return Err(WandelscriptError::nested_sync(range).into());
        }
        if let Some(body) = body {
            self.eval_block(ctx, body).await?;
        }
        match self.drain(range).await {
            Ok(()) => {
                if let Some(then) = sync_then {
                    self.eval_block(ctx, then).await?;
                }
                Ok(())
            }
            Err(Unwind::Error(e)) if e.is_catchable_in_sync_except() => match except {
                Some(handler) => self.eval_block(ctx, handler).await,
                None => Err(Unwind::Error(e)),
            },
            other => other,
        }
    }

    async fn eval_robot_block(&self, ctx: &Ctx, range: SourceRange, arms: &[(Expr, Block)]) -> EvalResult<()> {
        for (robot_expr, body) in arms {
            let value = self.eval_expr(ctx, robot_expr).await?;
            let motion_group_id = match value {
                Value::Device(Device { id }) => id,
                Value::String(s) => s,
                Value::Frame(f) => f.name,
                other => return Err(WandelscriptError::wrong_robot(Some(robot_expr.range), format!("expected a robot reference, found {}", other.type_name())).into()),
            };
            let child = Scope::descend(&ctx.scope).map_err(Unwind::from)?;
            let arm_ctx = Ctx { scope: child, motion_group_id, in_robot_block: true };
            self.eval_block(&arm_ctx, body).await?;
        }
        self.drain(range).await
    }

    fn activate_interrupt(&self, name: &str, range: SourceRange) -> EvalResult<()> {
        let def = self.interrupts.borrow().get(name).cloned();
        let (when, body, scope) = def.ok_or_else(|| -> Unwind { WandelscriptError::name(range, name).into() })?;
        let evaluator = self.clone();
        let when = Rc::new(when);
        let body = Rc::new(body);
        let callback: InterruptCallback = Rc::new(move |state| {
            let evaluator = evaluator.clone();
            let when = when.clone();
            let body = body.clone();
            let scope = scope.clone();
            let state = state.clone();
            Box::pin(async move {
                let child = match Scope::descend(&scope) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                child.bind_local("path_parameter", Value::Float(state.path_parameter));
                child.bind_local("pose", Value::Pose(state.pose));
                let inner_ctx = Ctx { scope: child, motion_group_id: state.motion_group_id.clone(), in_robot_block: false };
                if let Ok(cond) = evaluator.eval_expr(&inner_ctx, &when).await {
                    if cond.is_truthy() {
                        let _ = evaluator.eval_block(&inner_ctx, &body).await;
                    }
                }
            })
        });
        self.action_queue.borrow_mut().register_interrupt(name.to_owned(), callback);
        Ok(())
    }

    async fn expect_device_id(&self, ctx: &Ctx, expr: &Expr) -> EvalResult<String> {
        match self.eval_expr(ctx, expr).await? {
            Value::Device(d) => Ok(d.id),
            Value::String(s) => Ok(s),
            other => Err(WandelscriptError::ty(expr.range, format!("expected a device, found {}", other.type_name())).into()),
        }
    }

    async fn expect_string_value(&self, ctx: &Ctx, expr: &Expr) -> EvalResult<String> {
        match self.eval_expr(ctx, expr).await? {
            Value::String(s) => Ok(s),
            other => Err(WandelscriptError::ty(expr.range, format!("expected a string, found {}", other.type_name())).into()),
        }
    }

    async fn frame_expr_name(&self, ctx: &Ctx, expr: &Expr) -> EvalResult<String> {
        if let ExprKind::Reference(name) = &expr.kind {
            if !ctx.scope.contains(name) {
                ctx.scope.frame_graph.borrow_mut().add_frame(name);
                return Ok(name.clone());
            }
        }
        match self.eval_expr(ctx, expr).await? {
            Value::Frame(f) => Ok(f.name),
            Value::String(s) => Ok(s),
            other => Err(WandelscriptError::ty(expr.range, format!("expected a frame, found {}", other.type_name())).into()),
        }
    }

    // ---- expressions -----------------------------------------------------

    pub fn eval_expr<'a>(&'a self, ctx: &'a Ctx, expr: &'a Expr) -> BoxFuture<'a, EvalResult<Value>> {
        Box::pin(async move {
            match &expr.kind {
                ExprKind::Int(v) => Ok(Value::Int(*v)),
                ExprKind::Float(v) => Ok(Value::Float(*v)),
                ExprKind::Bool(v) => Ok(Value::Bool(*v)),
                ExprKind::String(v) => Ok(Value::String(v.clone())),
                ExprKind::Reference(name) => self.eval_reference(ctx, name, expr.range),
                ExprKind::Tuple(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval_expr(ctx, item).await?);
                    }
                    Ok(tuple_literal_to_value(values))
                }
                ExprKind::List(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval_expr(ctx, item).await?);
                    }
                    Ok(Value::Tuple(values))
                }
                ExprKind::Record(fields) => {
                    let mut out = Vec::with_capacity(fields.len());
                    for (key, value_expr) in fields {
                        out.push((key.clone(), self.eval_expr(ctx, value_expr).await?));
                    }
                    Ok(Value::Record(Record { fields: out }))
                }
                ExprKind::Index { base, index } => {
                    let base_v = self.eval_expr(ctx, base).await?;
                    let index_v = self.eval_expr(ctx, index).await?;
                    self.index_value(&base_v, &index_v, expr.range)
                }
                ExprKind::Attribute { base, name } => {
                    let base_v = self.eval_expr(ctx, base).await?;
                    self.attribute_value(&base_v, name, expr.range)
                }
                ExprKind::Call { name, args } => {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval_expr(ctx, arg).await?);
                    }
                    self.eval_call(ctx, name, values, expr.range).await
                }
                ExprKind::Read { device, key } => {
                    let device_id = self.expect_device_id(ctx, device).await?;
                    let key = self.expect_string_value(ctx, key).await?;
                    self.action_queue
                        .borrow()
                        .run_action_now(&ActionKind::Read { device_id, key }, self.cell.as_ref())
                        .await
                        .map_err(Unwind::from)
                }
                ExprKind::Binary { op, left, right } => self.eval_binary(ctx, *op, left, right, expr.range).await,
                ExprKind::Unary { op, operand } => {
                    let value = self.eval_expr(ctx, operand).await?;
                    match op {
                        UnOp::Neg => value.negate(expr.range).map_err(Unwind::from),
                        UnOp::Pos => value.as_float().map(|_| value.clone()).ok_or_else(|| WandelscriptError::ty(expr.range, "unary + requires a number").into()),
                        UnOp::Not => Ok(Value::Bool(!value.is_truthy())),
                        UnOp::Invert => value.invert(expr.range).map_err(Unwind::from),
                    }
                }
                ExprKind::FrameRelation { target, source } => {
                    let target_name = self.frame_expr_name(ctx, target).await?;
                    let source_name = self.frame_expr_name(ctx, source).await?;
                    let pose = ctx.scope.frame_graph.borrow().eval(&target_name, &source_name).map_err(Unwind::from)?;
                    Ok(Value::Pose(pose))
                }
            }
        })
    }

    fn eval_reference(&self, ctx: &Ctx, name: &str, range: SourceRange) -> EvalResult<Value> {
        if name == "flange" {
            return Ok(Value::Frame(ctx.scope.flange.clone()));
        }
        if name == "robot" {
            return Ok(Value::Frame(ctx.scope.robot_frame.clone()));
        }
        ctx.scope.get(name).ok_or_else(|| WandelscriptError::name(range, name).into())
    }

    fn index_value(&self, base: &Value, index: &Value, range: SourceRange) -> EvalResult<Value> {
        match base {
            Value::Tuple(items) => {
                let i = index.as_float().ok_or_else(|| -> Unwind { WandelscriptError::ty(range, "index must be a number").into() })? as i64;
                items.get(i as usize).cloned().ok_or_else(|| WandelscriptError::ty(range, "tuple index out of range").into())
            }
            Value::Record(record) => {
                let key = match index {
                    Value::String(s) => s.as_str(),
                    _ => return Err(WandelscriptError::ty(range, "record index must be a string").into()),
                };
                record.get(key).cloned().ok_or_else(|| WandelscriptError::name(range, key).into())
            }
            Value::Vector3(v) => {
                let i = index.as_float().ok_or_else(|| -> Unwind { WandelscriptError::ty(range, "index must be a number").into() })? as i64;
                match i {
                    0 => Ok(Value::Float(v.x)),
                    1 => Ok(Value::Float(v.y)),
                    2 => Ok(Value::Float(v.z)),
                    _ => Err(WandelscriptError::ty(range, "vector index out of range").into()),
                }
            }
            Value::Pose(p) => {
                let i = index.as_float().ok_or_else(|| -> Unwind { WandelscriptError::ty(range, "index must be a number").into() })? as i64;
                match i {
                    0 => Ok(Value::Float(p.position.x)),
                    1 => Ok(Value::Float(p.position.y)),
                    2 => Ok(Value::Float(p.position.z)),
                    3 => Ok(Value::Float(p.orientation.x)),
                    4 => Ok(Value::Float(p.orientation.y)),
                    5 => Ok(Value::Float(p.orientation.z)),
                    _ => Err(WandelscriptError::ty(range, "pose index out of range").into()),
                }
            }
            other => Err(WandelscriptError::ty(range, format!("{} is not indexable", other.type_name())).into()),
        }
    }

    fn attribute_value(&self, base: &Value, name: &str, range: SourceRange) -> EvalResult<Value> {
        match base {
            Value::Vector3(v) => match name {
                "x" => Ok(Value::Float(v.x)),
                "y" => Ok(Value::Float(v.y)),
                "z" => Ok(Value::Float(v.z)),
                other => Err(WandelscriptError::ty(range, format!("vector has no field '{other}'")).into()),
            },
            Value::Pose(p) => match name {
                "position" => Ok(Value::Vector3(p.position)),
                "orientation" => Ok(Value::Vector3(p.orientation)),
                other => Err(WandelscriptError::ty(range, format!("pose has no field '{other}'")).into()),
            },
            Value::Record(record) => record.get(name).cloned().ok_or_else(|| WandelscriptError::name(range, name).into()),
            other => Err(WandelscriptError::ty(range, format!("{} has no field '{name}'", other.type_name())).into()),
        }
    }

    async fn eval_binary(&self, ctx: &Ctx, op: BinOp, left: &Expr, right: &Expr, range: SourceRange) -> EvalResult<Value> {
        if matches!(op, BinOp::And | BinOp::Or) {
            let left_v = self.eval_expr(ctx, left).await?;
            let take_left = match op {
                BinOp::And => !left_v.is_truthy(),
                BinOp::Or => left_v.is_truthy(),
                _ => unreachable!(),
            };
            if take_left {
                return Ok(left_v);
            }
            return self.eval_expr(ctx, right).await;
        }
        let left_v = self.eval_expr(ctx, left).await?;
        let right_v = self.eval_expr(ctx, right).await?;
        match op {
            BinOp::Add => left_v.add(&right_v, range).map_err(Unwind::from),
            BinOp::Sub => left_v.sub(&right_v, range).map_err(Unwind::from),
            BinOp::Mul => left_v.mul(&right_v, range).map_err(Unwind::from),
            BinOp::Div => left_v.div(&right_v, range).map_err(Unwind::from),
            BinOp::Compose => left_v.compose(&right_v, range).map_err(Unwind::from),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => left_v.compare(&right_v, range, op).map_err(Unwind::from),
            BinOp::And | BinOp::Or => unreachable!(),
        }
    }

    /// Call resolution order (§4.5): builtin, then a user-defined closure
    /// bound in scope, then a registered foreign function, else `NameError`.
    async fn eval_call(&self, ctx: &Ctx, name: &str, args: Vec<Value>, range: SourceRange) -> EvalResult<Value> {
        if let Some(result) = call_builtin(name, args.clone(), range, &self.builtin_ctx(ctx)).await {
            return result;
        }
        if let Some(Value::Closure(closure)) = ctx.scope.get(name) {
            return self.call_closure(ctx, &closure, args, range).await;
        }
        Err(WandelscriptError::name(range, name).into())
    }

    async fn call_closure(&self, ctx: &Ctx, closure: &Rc<Closure>, args: Vec<Value>, range: SourceRange) -> EvalResult<Value> {
        if args.len() != closure.params.len() {
            return Err(WandelscriptError::ty(range, format!("expected {} argument(s), got {}", closure.params.len(), args.len())).into());
        }
        let child = Scope::descend(&closure.scope).map_err(Unwind::from)?;
        for (param, value) in closure.params.iter().zip(args.into_iter()) {
            child.bind_local(param, value);
        }
        // Closures close over the scope they were defined in, but keep
        // inheriting the caller's motion group / robot-block context so a
        // function called from inside `do with ...:` still queues to the
        // right robot.
        let call_ctx = ctx.with_scope(child);
        let mut result = match self.eval_block(&call_ctx, &closure.body).await {
            Ok(()) => Value::Tuple(Vec::new()),
            Err(Unwind::Signal(Signal::Return(v))) => v,
            Err(other) => return Err(other),
        };
        for link in &closure.pose_chain {
            match link {
                PoseChainLink::ComposeAfter(pose) => {
                    if let Value::Pose(p) = result {
                        result = Value::Pose(p.compose(*pose));
                    }
                }
                PoseChainLink::ComposeBefore(pose) => {
                    if let Value::Pose(p) = result {
                        result = Value::Pose(pose.compose(p));
                    }
                }
                PoseChainLink::ComposeClosure(_) => {
                    // Chained closure composition beyond pose pre/post-multiplication is not
                    // exercised by this core; the external planner owns full trajectory blending.
                }
            }
        }
        Ok(result)
    }
}

/// `(x,y,z)`/`(x,y,z,rx,ry,rz)` tuple literals denote a `Vector3`/`Pose`
/// directly rather than a generic tuple, matching how the reference
/// implementation's coordinate literals are written in source (§6.1, §8).
/// Square-bracket lists never get this treatment.
fn tuple_literal_to_value(items: Vec<Value>) -> Value {
    let all_numeric = items.iter().all(|v| matches!(v, Value::Int(_) | Value::Float(_)));
    if all_numeric && items.len() == 3 {
        let mut n = items.iter().map(|v| v.as_float().unwrap());
        return Value::Vector3(Vector3::new(n.next().unwrap(), n.next().unwrap(), n.next().unwrap()));
    }
    if all_numeric && items.len() == 6 {
        let mut n = items.iter().map(|v| v.as_float().unwrap());
        let position = Vector3::new(n.next().unwrap(), n.next().unwrap(), n.next().unwrap());
        let orientation = Vector3::new(n.next().unwrap(), n.next().unwrap(), n.next().unwrap());
        return Value::Pose(Pose::new(position, orientation));
    }
    Value::Tuple(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use crate::robot_cell::SimulatedRobotCell;

    fn new_evaluator() -> Evaluator {
        Evaluator::new(Arc::new(SimulatedRobotCell::new()))
    }

    async fn run(source: &str) -> (Evaluator, Rc<Scope>) {
        let program = parse_program(source).unwrap();
        let evaluator = new_evaluator();
        let scope = Scope::root();
        let ctx = Ctx::root(scope.clone());
        evaluator.eval_block(&ctx, &program.body).await.unwrap();
        (evaluator, scope)
    }

    #[tokio::test]
    async fn int_conversion_truncates() {
        let (_e, scope) = run("a = int(5.63)\n").await;
        assert_eq!(scope.get("a"), Some(Value::Int(5)));
    }

    #[tokio::test]
    async fn vector_addition_assigns_result() {
        let (_e, scope) = run("a = (0, 1, 2) + (0, 0, 3)\n").await;
        assert_eq!(scope.get("a"), Some(Value::Vector3(Vector3::new(0.0, 1.0, 5.0))));
    }

    #[tokio::test]
    async fn for_loop_accumulates() {
        let (_e, scope) = run("a = 0\nfor i in 0..<3:\n    a = a + i\n").await;
        assert_eq!(scope.get("a"), Some(Value::Int(3)));
    }

    #[tokio::test]
    async fn with_blending_restores_ambient_setting_after_block() {
        let (_e, scope) = run("with blending(20):\n    a = 1\nb = 2\n").await;
        assert!(scope.get(&MotionSettings::varname("blending")).is_none());
        assert_eq!(scope.get("b"), Some(Value::Int(2)));
    }

    #[tokio::test]
    async fn raise_produces_user_error() {
        let program = parse_program("raise \"boom\"\n").unwrap();
        let evaluator = new_evaluator();
        let ctx = Ctx::root(Scope::root());
        let result = evaluator.eval_block(&ctx, &program.body).await;
        match result {
            Err(Unwind::Error(WandelscriptError::User { message, .. })) => assert!(message.contains("boom")),
            other => panic!("expected user error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nested_sync_inside_robot_block_is_an_error() {
        let program = parse_program("do with \"robot\":\n    sync\n").unwrap();
        let evaluator = new_evaluator();
        let ctx = Ctx::root(Scope::root());
        let result = evaluator.eval_block(&ctx, &program.body).await;
        assert!(matches!(result, Err(Unwind::Error(WandelscriptError::NestedSync { .. }))));
    }
}
