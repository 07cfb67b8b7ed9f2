//! The builtin function surface (§6.2), grounded on the reference
//! implementation's `builtins/__init__.py` and `builtins/pose.py`: math and
//! conversion helpers, sequence operations, the per-field motion-settings
//! modifiers generated from `MotionSettings`, frame/tcp/pose constructors,
//! the `fetch()` HTTP helper, and `print()` captured into the program's own
//! stdout buffer rather than the process's real one.

use std::cell::RefCell;
use std::rc::Rc;

use crate::action_queue::ActionQueue;
use crate::error::{EvalResult, SourceRange, Unwind, WandelscriptError};
use crate::motion::MotionSettings;
use crate::robot_cell::RobotCell;
use crate::serializer::json_to_value;
use crate::store::Scope;
use crate::value::{Pose, Record, Value, Vector3};

/// Everything a builtin needs besides its arguments: the calling scope (for
/// constructors that must read/write motion-settings variables), the action
/// queue and cell for IO, and the program's captured stdout.
pub struct BuiltinContext<'a> {
    pub scope: &'a Rc<Scope>,
    pub action_queue: &'a RefCell<ActionQueue>,
    pub cell: &'a dyn RobotCell,
    pub stdout: &'a RefCell<String>,
    pub motion_group_id: &'a str,
}

fn arity_error(range: SourceRange, name: &str, expected: usize, got: usize) -> Unwind {
    WandelscriptError::ty(range, format!("{name}() takes {expected} argument(s), got {got}")).into()
}

fn expect_float(value: &Value, range: SourceRange) -> EvalResult<f64> {
    value.as_float().ok_or_else(|| WandelscriptError::ty(range, format!("expected a number, found {}", value.type_name())).into())
}

fn expect_pose(value: &Value, range: SourceRange) -> EvalResult<Pose> {
    value.as_pose().ok_or_else(|| WandelscriptError::ty(range, format!("expected a pose, found {}", value.type_name())).into())
}

fn expect_vector3(value: &Value, range: SourceRange) -> EvalResult<Vector3> {
    value.as_vector3().ok_or_else(|| WandelscriptError::ty(range, format!("expected a vector, found {}", value.type_name())).into())
}

fn expect_string<'v>(value: &'v Value, range: SourceRange) -> EvalResult<&'v str> {
    match value {
        Value::String(s) => Ok(s.as_str()),
        other => Err(WandelscriptError::ty(range, format!("expected a string, found {}", other.type_name())).into()),
    }
}

/// A motion-settings modifier marker, recognized by `WithContext`/`Move`
/// evaluation: a record tagged `__modifier__` carrying the store variable
/// name to set and its value for the duration of the block (§6.2).
pub fn is_modifier(record: &Record) -> bool {
    record.get("__modifier__").is_some()
}

pub fn modifier_varname(record: &Record) -> Option<String> {
    match record.get("__modifier__") {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

pub fn modifier_value(record: &Record) -> Option<Value> {
    record.get("__value__").cloned()
}

fn make_modifier(field: &str, value: Value) -> Value {
    Value::Record(Record {
        fields: vec![
            ("__modifier__".to_owned(), Value::String(MotionSettings::varname(field))),
            ("__value__".to_owned(), value),
        ],
    })
}

/// Attempts to evaluate `name(args)` as a builtin. Returns `None` if `name`
/// is not a builtin, so the evaluator can fall through to user closures and
/// finally a `NameError` (§4.5 call resolution order).
pub async fn call_builtin(name: &str, args: Vec<Value>, range: SourceRange, ctx: &BuiltinContext<'_>) -> Option<EvalResult<Value>> {
    Some(match name {
        // ---- math --------------------------------------------------
        "sin" | "cos" | "tan" | "sinh" | "cosh" | "tanh" | "sqrt" | "abs" | "floor" | "ceil" | "exp" | "log" => {
            dispatch_unary_math(name, &args, range)
        }
        "min" | "max" => dispatch_minmax(name, &args, range),
        "pow" | "power" => (|| {
            if args.len() != 2 {
                return Err(arity_error(range, name, 2, args.len()));
            }
            let base = expect_float(&args[0], range)?;
            let exp = expect_float(&args[1], range)?;
            Ok(Value::Float(base.powf(exp)))
        })(),
        "intdiv" => (|| {
            if args.len() != 2 {
                return Err(arity_error(range, "intdiv", 2, args.len()));
            }
            let a = expect_float(&args[0], range)?;
            let b = expect_float(&args[1], range)?;
            if b == 0.0 {
                return Err(WandelscriptError::ty(range, "integer division by zero").into());
            }
            Ok(Value::Int((a / b).floor() as i64))
        })(),
        "modulo" => (|| {
            if args.len() != 2 {
                return Err(arity_error(range, "modulo", 2, args.len()));
            }
            let a = expect_float(&args[0], range)?;
            let b = expect_float(&args[1], range)?;
            if b == 0.0 {
                return Err(WandelscriptError::ty(range, "modulo by zero").into());
            }
            Ok(Value::Float(a.rem_euclid(b)))
        })(),
        "divmod" => (|| {
            if args.len() != 2 {
                return Err(arity_error(range, "divmod", 2, args.len()));
            }
            let a = expect_float(&args[0], range)?;
            let b = expect_float(&args[1], range)?;
            if b == 0.0 {
                return Err(WandelscriptError::ty(range, "divmod by zero").into());
            }
            Ok(Value::Tuple(vec![Value::Int((a / b).floor() as i64), Value::Float(a.rem_euclid(b))]))
        })(),
        "round" => (|| {
            if args.is_empty() || args.len() > 2 {
                return Err(arity_error(range, "round", 1, args.len()));
            }
            let v = expect_float(&args[0], range)?;
            let digits = if args.len() == 2 { expect_float(&args[1], range)? as i32 } else { 0 };
            let factor = 10f64.powi(digits);
            Ok(Value::Float((v * factor).round() / factor))
        })(),

        // ---- conversions --------------------------------------------
        "int" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, "int", 1, args.len()));
            }
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Float(f) => Ok(Value::Int(*f as i64)),
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| WandelscriptError::ty(range, format!("cannot convert '{s}' to int")).into()),
                other => Err(WandelscriptError::ty(range, format!("cannot convert {} to int", other.type_name())).into()),
            }
        })(),
        "float" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, "float", 1, args.len()));
            }
            match &args[0] {
                Value::Int(i) => Ok(Value::Float(*i as f64)),
                Value::Float(f) => Ok(Value::Float(*f)),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| WandelscriptError::ty(range, format!("cannot convert '{s}' to float")).into()),
                other => Err(WandelscriptError::ty(range, format!("cannot convert {} to float", other.type_name())).into()),
            }
        })(),
        "str" | "string" | "to_string" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, name, 1, args.len()));
            }
            Ok(Value::String(display_value(&args[0])))
        })(),
        "bool" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, "bool", 1, args.len()));
            }
            Ok(Value::Bool(args[0].is_truthy()))
        })(),

        // ---- sequence ops ---------------------------------------------
        "len" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, "len", 1, args.len()));
            }
            match &args[0] {
                Value::Tuple(items) => Ok(Value::Int(items.len() as i64)),
                Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::Record(r) => Ok(Value::Int(r.fields.len() as i64)),
                other => Err(WandelscriptError::ty(range, format!("{} has no len()", other.type_name())).into()),
            }
        })(),
        "reverse" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, "reverse", 1, args.len()));
            }
            match &args[0] {
                Value::Tuple(items) => {
                    let mut reversed = items.clone();
                    reversed.reverse();
                    Ok(Value::Tuple(reversed))
                }
                other => Err(WandelscriptError::ty(range, format!("{} is not reversible", other.type_name())).into()),
            }
        })(),
        "assoc" => (|| {
            if args.len() != 3 {
                return Err(arity_error(range, "assoc", 3, args.len()));
            }
            let key = expect_string(&args[1], range)?;
            match &args[0] {
                Value::Record(r) => Ok(Value::Record(r.assoc(key, args[2].clone()))),
                Value::Tuple(items) => {
                    let index: usize = key.parse().map_err(|_| -> Unwind { WandelscriptError::ty(range, "tuple assoc() key must be an index").into() })?;
                    let mut updated = items.clone();
                    if index >= updated.len() {
                        return Err(WandelscriptError::ty(range, "tuple assoc() index out of range").into());
                    }
                    updated[index] = args[2].clone();
                    Ok(Value::Tuple(updated))
                }
                Value::Vector3(v) => {
                    let mut v = *v;
                    set_vector3_field(&mut v, key, expect_float(&args[2], range)?, range)?;
                    Ok(Value::Vector3(v))
                }
                Value::Pose(p) => {
                    let mut p = *p;
                    match key {
                        "position" => p.position = expect_vector3(&args[2], range)?,
                        "orientation" => p.orientation = expect_vector3(&args[2], range)?,
                        other => return Err(WandelscriptError::ty(range, format!("pose has no field '{other}'")).into()),
                    }
                    Ok(Value::Pose(p))
                }
                other => Err(WandelscriptError::ty(range, format!("{} does not support assoc()", other.type_name())).into()),
            }
        })(),

        // ---- motion-settings modifiers ---------------------------------
        "velocity" | "acceleration" | "blending" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, name, 1, args.len()));
            }
            let value = expect_float(&args[0], range)?;
            Ok(make_modifier(name, Value::Float(value)))
        })(),

        // ---- tcp / frame / pose constructors ---------------------------
        "tcp" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, "tcp", 1, args.len()));
            }
            let tool = expect_string(&args[0], range)?;
            Ok(make_modifier("tcp", Value::String(tool.to_owned())))
        })(),
        "frame" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, "frame", 1, args.len()));
            }
            let frame_name = expect_string(&args[0], range)?;
            ctx.scope.frame_graph.borrow_mut().add_frame(frame_name);
            Ok(Value::Frame(crate::value::Frame { name: frame_name.to_owned(), graph: ctx.scope.frame_graph.clone() }))
        })(),
        "planned_pose" => (|| {
            let queue = ctx.action_queue.borrow();
            queue
                .last_pose(ctx.motion_group_id)
                .map(Value::Pose)
                .ok_or_else(|| WandelscriptError::motion(Some(range), "no planned pose yet for this motion group").into())
        })(),
        "interpolate" => (|| {
            if args.len() != 3 {
                return Err(arity_error(range, "interpolate", 3, args.len()));
            }
            let a = expect_pose(&args[0], range)?;
            let b = expect_pose(&args[1], range)?;
            let t = expect_float(&args[2], range)?;
            Ok(Value::Pose(a.interpolate(b, t)))
        })(),
        "distance" => (|| {
            if args.len() != 2 {
                return Err(arity_error(range, "distance", 2, args.len()));
            }
            match (&args[0], &args[1]) {
                (Value::Pose(_), _) | (_, Value::Pose(_)) => {
                    let a = expect_pose(&args[0], range)?;
                    let b = expect_pose(&args[1], range)?;
                    Ok(Value::Float(a.distance(b)))
                }
                _ => {
                    let a = expect_vector3(&args[0], range)?;
                    let b = expect_vector3(&args[1], range)?;
                    Ok(Value::Float(a.distance(b)))
                }
            }
        })(),
        "to_position" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, "to_position", 1, args.len()));
            }
            Ok(Value::Vector3(expect_pose(&args[0], range)?.position))
        })(),
        "to_orientation" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, "to_orientation", 1, args.len()));
            }
            Ok(Value::Vector3(expect_pose(&args[0], range)?.orientation))
        })(),
        "to_pose" => (|| {
            if args.len() != 2 {
                return Err(arity_error(range, "to_pose", 2, args.len()));
            }
            let position = expect_vector3(&args[0], range)?;
            let orientation = expect_vector3(&args[1], range)?;
            Ok(Value::Pose(Pose::new(position, orientation)))
        })(),

        // ---- IO ---------------------------------------------------------
        "wait_for_bool_io" => return Some(wait_for_bool_io(args, range, ctx).await),
        "fetch" => return Some(fetch(args, range).await),

        // ---- misc ---------------------------------------------------------
        "print" => (|| {
            if args.len() != 1 {
                return Err(arity_error(range, "print", 1, args.len()));
            }
            ctx.stdout.borrow_mut().push_str(&display_value(&args[0]));
            ctx.stdout.borrow_mut().push('\n');
            Ok(Value::Bool(true))
        })(),
        "time" => {
            let millis = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as f64)
                .unwrap_or(0.0);
            Ok(Value::Float(millis))
        }

        _ => return None,
    })
}

fn dispatch_unary_math(name: &str, args: &[Value], range: SourceRange) -> EvalResult<Value> {
    if args.len() != 1 {
        return Err(arity_error(range, name, 1, args.len()));
    }
    let x = expect_float(&args[0], range)?;
    let result = match name {
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "sinh" => x.sinh(),
        "cosh" => x.cosh(),
        "tanh" => x.tanh(),
        "sqrt" => x.sqrt(),
        "abs" => x.abs(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        "exp" => x.exp(),
        "log" => x.ln(),
        _ => unreachable!(),
    };
    if matches!(args[0], Value::Int(_)) && matches!(name, "abs") {
        return Ok(Value::Int(result as i64));
    }
    Ok(Value::Float(result))
}

fn dispatch_minmax(name: &str, args: &[Value], range: SourceRange) -> EvalResult<Value> {
    if args.is_empty() {
        return Err(arity_error(range, name, 1, 0));
    }
    let mut best = args[0].clone();
    let mut best_f = expect_float(&best, range)?;
    for candidate in &args[1..] {
        let f = expect_float(candidate, range)?;
        let take = if name == "min" { f < best_f } else { f > best_f };
        if take {
            best = candidate.clone();
            best_f = f;
        }
    }
    Ok(best)
}

fn set_vector3_field(v: &mut Vector3, field: &str, value: f64, range: SourceRange) -> EvalResult<()> {
    match field {
        "x" => v.x = value,
        "y" => v.y = value,
        "z" => v.z = value,
        other => return Err(WandelscriptError::ty(range, format!("vector has no field '{other}'")).into()),
    }
    Ok(())
}

async fn wait_for_bool_io(args: Vec<Value>, range: SourceRange, ctx: &BuiltinContext<'_>) -> EvalResult<Value> {
    if args.len() != 2 {
        return Err(arity_error(range, "wait_for_bool_io", 2, args.len()));
    }
    let device_id = expect_string(&args[0], range)?.to_owned();
    let key = expect_string(&args[1], range)?.to_owned();
    let device = ctx
        .cell
        .get_device(&device_id)
        .ok_or_else(|| -> Unwind { WandelscriptError::configuration(format!("unknown device '{device_id}'")).into() })?;
    loop {
        let value = device.read(&key).await.map_err(Unwind::from)?;
        if value.is_truthy() {
            return Ok(Value::Bool(true));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

async fn fetch(args: Vec<Value>, range: SourceRange) -> EvalResult<Value> {
    if args.is_empty() || args.len() > 2 {
        return Err(arity_error(range, "fetch", 1, args.len()));
    }
    let url = expect_string(&args[0], range)?.to_owned();
    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| -> Unwind { WandelscriptError::generic(Some(range), format!("fetch failed: {e}")).into() })?;
    let json: serde_json::Value = response
        .json()
        .await
        .map_err(|e| -> Unwind { WandelscriptError::generic(Some(range), format!("fetch response was not JSON: {e}")).into() })?;
    Ok(json_to_value(&json))
}

/// User-facing rendering for `print()`/`str()`, distinct from `{:?}` Debug.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format!("{f}"),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        Value::Vector3(v) => format!("({}, {}, {})", v.x, v.y, v.z),
        Value::Pose(p) => format!(
            "({}, {}, {}, {}, {}, {})",
            p.position.x, p.position.y, p.position.z, p.orientation.x, p.orientation.y, p.orientation.z
        ),
        Value::Tuple(items) => format!("({})", items.iter().map(display_value).collect::<Vec<_>>().join(", ")),
        Value::Record(record) => {
            format!("{{{}}}", record.fields.iter().map(|(k, v)| format!("{k}: {}", display_value(v))).collect::<Vec<_>>().join(", "))
        }
        Value::Frame(frame) => frame.name.clone(),
        Value::Closure(_) => "<closure>".to_owned(),
        Value::Device(device) => format!("<device {}>", device.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Scope;
    use std::cell::RefCell;

    fn ctx<'a>(scope: &'a Rc<Scope>, queue: &'a RefCell<ActionQueue>, cell: &'a dyn RobotCell, stdout: &'a RefCell<String>) -> BuiltinContext<'a> {
        BuiltinContext { scope, action_queue: queue, cell, stdout, motion_group_id: "robot" }
    }

    #[tokio::test]
    async fn int_truncates_float() {
        let scope = Scope::root();
        let queue = RefCell::new(ActionQueue::new());
        let cell = crate::robot_cell::SimulatedRobotCell::new();
        let stdout = RefCell::new(String::new());
        let result = call_builtin("int", vec![Value::Float(5.63)], SourceRange::default(), &ctx(&scope, &queue, &cell, &stdout))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[tokio::test]
    async fn velocity_builds_a_tagged_modifier() {
        let scope = Scope::root();
        let queue = RefCell::new(ActionQueue::new());
        let cell = crate::robot_cell::SimulatedRobotCell::new();
        let stdout = RefCell::new(String::new());
        let result = call_builtin("velocity", vec![Value::Float(10.0)], SourceRange::default(), &ctx(&scope, &queue, &cell, &stdout))
            .await
            .unwrap()
            .unwrap();
        match result {
            Value::Record(r) => assert!(is_modifier(&r)),
            _ => panic!("expected record"),
        }
    }

    #[tokio::test]
    async fn print_is_captured_not_written_to_real_stdout() {
        let scope = Scope::root();
        let queue = RefCell::new(ActionQueue::new());
        let cell = crate::robot_cell::SimulatedRobotCell::new();
        let stdout = RefCell::new(String::new());
        call_builtin("print", vec![Value::Int(42)], SourceRange::default(), &ctx(&scope, &queue, &cell, &stdout)).await.unwrap().unwrap();
        assert_eq!(stdout.borrow().as_str(), "42\n");
    }

    #[tokio::test]
    async fn intdiv_and_modulo_match_divmod() {
        let scope = Scope::root();
        let queue = RefCell::new(ActionQueue::new());
        let cell = crate::robot_cell::SimulatedRobotCell::new();
        let stdout = RefCell::new(String::new());
        let c = ctx(&scope, &queue, &cell, &stdout);
        let q = call_builtin("intdiv", vec![Value::Int(7), Value::Int(2)], SourceRange::default(), &c).await.unwrap().unwrap();
        assert_eq!(q, Value::Int(3));
        let r = call_builtin("modulo", vec![Value::Int(7), Value::Int(2)], SourceRange::default(), &c).await.unwrap().unwrap();
        assert_eq!(r, Value::Float(1.0));
        let dm = call_builtin("divmod", vec![Value::Int(7), Value::Int(2)], SourceRange::default(), &c).await.unwrap().unwrap();
        assert_eq!(dm, Value::Tuple(vec![Value::Int(3), Value::Float(1.0)]));
    }

    #[tokio::test]
    async fn reverse_reverses_a_tuple() {
        let scope = Scope::root();
        let queue = RefCell::new(ActionQueue::new());
        let cell = crate::robot_cell::SimulatedRobotCell::new();
        let stdout = RefCell::new(String::new());
        let result = call_builtin("reverse", vec![Value::Tuple(vec![Value::Int(1), Value::Int(2), Value::Int(3)])], SourceRange::default(), &ctx(&scope, &queue, &cell, &stdout))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Value::Tuple(vec![Value::Int(3), Value::Int(2), Value::Int(1)]));
    }

    #[tokio::test]
    async fn to_string_and_string_match_str() {
        let scope = Scope::root();
        let queue = RefCell::new(ActionQueue::new());
        let cell = crate::robot_cell::SimulatedRobotCell::new();
        let stdout = RefCell::new(String::new());
        let c = ctx(&scope, &queue, &cell, &stdout);
        for name in ["str", "string", "to_string"] {
            let result = call_builtin(name, vec![Value::Int(42)], SourceRange::default(), &c).await.unwrap().unwrap();
            assert_eq!(result, Value::String("42".to_owned()));
        }
    }

    #[tokio::test]
    async fn time_returns_a_nonzero_wall_clock_reading() {
        let scope = Scope::root();
        let queue = RefCell::new(ActionQueue::new());
        let cell = crate::robot_cell::SimulatedRobotCell::new();
        let stdout = RefCell::new(String::new());
        let result = call_builtin("time", vec![], SourceRange::default(), &ctx(&scope, &queue, &cell, &stdout)).await.unwrap().unwrap();
        match result {
            Value::Float(ms) => assert!(ms > 0.0),
            _ => panic!("expected float"),
        }
    }

    #[tokio::test]
    async fn unknown_name_returns_none() {
        let scope = Scope::root();
        let queue = RefCell::new(ActionQueue::new());
        let cell = crate::robot_cell::SimulatedRobotCell::new();
        let stdout = RefCell::new(String::new());
        let result = call_builtin("does_not_exist", vec![], SourceRange::default(), &ctx(&scope, &queue, &cell, &stdout)).await;
        assert!(result.is_none());
    }
}
