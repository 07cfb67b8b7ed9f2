//! Tagged value union and operator dispatch (component C, §3 / §4.3).
//!
//! Mirrors the reference implementation's `VariableValue`-style design: one
//! flat enum, arithmetic traits implemented as `match (self, rhs) { ... }`
//! over tag pairs, with a `TypeError` for every unsupported combination
//! instead of a panic.

use std::rc::Rc;

use crate::ast::Block;
use crate::error::{SourceRange, WandelscriptError};
use crate::frame_graph::FrameGraph;
use crate::store::Scope;

pub type Float = f64;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: Float,
    pub y: Float,
    pub z: Float,
}

impl Vector3 {
    pub fn new(x: Float, y: Float, z: Float) -> Self {
        Vector3 { x, y, z }
    }

    pub fn zero() -> Self {
        Vector3::default()
    }

    pub fn add(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, s: Float) -> Vector3 {
        Vector3::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn distance(self, other: Vector3) -> Float {
        self.sub(other).norm()
    }

    pub fn norm(self) -> Float {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// A rigid-body transform: position plus an orientation represented as an
/// axis-angle-style rotation vector (3 components), matching the 6-tuple
/// pose literal `(x, y, z, rx, ry, rz)` of §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub position: Vector3,
    pub orientation: Vector3,
}

impl Pose {
    pub fn new(position: Vector3, orientation: Vector3) -> Self {
        Pose { position, orientation }
    }

    pub fn identity() -> Self {
        Pose::default()
    }

    /// `::` composition: rotate `rhs`'s position into this pose's frame, then
    /// translate; orientations compose as true SO(3) rotations (via an
    /// internal quaternion), not merely added, so `a :: ~a == identity` holds
    /// for any orientation, not only axis-aligned ones.
    pub fn compose(self, rhs: Pose) -> Pose {
        let q_self = Quaternion::from_rotation_vector(self.orientation);
        let q_rhs = Quaternion::from_rotation_vector(rhs.orientation);
        let rotated = q_self.rotate(rhs.position);
        Pose { position: self.position.add(rotated), orientation: q_self.mul(q_rhs).to_rotation_vector() }
    }

    pub fn inverse(self) -> Pose {
        let q_inv = Quaternion::from_rotation_vector(self.orientation).conjugate();
        let inv_position = q_inv.rotate(self.position).scale(-1.0);
        Pose { position: inv_position, orientation: q_inv.to_rotation_vector() }
    }

    pub fn interpolate(self, other: Pose, t: Float) -> Pose {
        Pose {
            position: self.position.scale(1.0 - t).add(other.position.scale(t)),
            orientation: self.orientation.scale(1.0 - t).add(other.orientation.scale(t)),
        }
    }

    pub fn distance(self, other: Pose) -> Float {
        self.position.distance(other.position)
    }

    pub fn approx_eq(self, other: Pose, eps: Float) -> bool {
        (self.position.x - other.position.x).abs() < eps
            && (self.position.y - other.position.y).abs() < eps
            && (self.position.z - other.position.z).abs() < eps
            && (self.orientation.x - other.orientation.x).abs() < eps
            && (self.orientation.y - other.orientation.y).abs() < eps
            && (self.orientation.z - other.orientation.z).abs() < eps
    }
}

/// Unit quaternion, used only internally to compose/invert the axis-angle
/// rotation vectors `Pose::orientation` exposes publicly. Converting through
/// quaternions rather than composing the rotation vectors directly gives
/// exact SO(3) composition instead of a small-angle approximation.
#[derive(Debug, Clone, Copy)]
struct Quaternion {
    w: Float,
    x: Float,
    y: Float,
    z: Float,
}

impl Quaternion {
    fn identity() -> Self {
        Quaternion { w: 1.0, x: 0.0, y: 0.0, z: 0.0 }
    }

    /// Builds the unit quaternion for the rotation vector `r` (direction =
    /// axis, magnitude = angle in radians).
    fn from_rotation_vector(r: Vector3) -> Self {
        let angle = r.norm();
        if angle < 1e-12 {
            return Quaternion::identity();
        }
        let axis = r.scale(1.0 / angle);
        let half = angle / 2.0;
        let s = half.sin();
        Quaternion { w: half.cos(), x: axis.x * s, y: axis.y * s, z: axis.z * s }
    }

    /// Recovers the axis-angle rotation vector, renormalizing first to guard
    /// against floating-point drift after repeated composition.
    fn to_rotation_vector(self) -> Vector3 {
        let norm = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        let (w, x, y, z) = if norm > 1e-12 { (self.w / norm, self.x / norm, self.y / norm, self.z / norm) } else { (1.0, 0.0, 0.0, 0.0) };
        let w = w.clamp(-1.0, 1.0);
        let angle = 2.0 * w.acos();
        let s = (1.0 - w * w).sqrt();
        if s < 1e-12 {
            return Vector3::zero();
        }
        Vector3::new(x / s, y / s, z / s).scale(angle)
    }

    fn mul(self, rhs: Quaternion) -> Quaternion {
        Quaternion {
            w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        }
    }

    /// Unit-quaternion conjugate, i.e. its inverse.
    fn conjugate(self) -> Quaternion {
        Quaternion { w: self.w, x: -self.x, y: -self.y, z: -self.z }
    }

    /// Rotates `v` via `q v q*`.
    fn rotate(self, v: Vector3) -> Vector3 {
        let qv = Quaternion { w: 0.0, x: v.x, y: v.y, z: v.z };
        let rotated = self.mul(qv).mul(self.conjugate());
        Vector3::new(rotated.x, rotated.y, rotated.z)
    }
}

/// An ordered mapping from string key to Value. Frozen: all "mutators" are
/// associative and return a new `Record`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub fields: Vec<(String, Value)>,
}

impl Record {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn assoc(&self, key: &str, value: Value) -> Record {
        let mut fields = self.fields.clone();
        if let Some(slot) = fields.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            fields.push((key.to_owned(), value));
        }
        Record { fields }
    }
}

#[derive(Debug, Clone)]
pub struct Closure {
    pub scope: Rc<Scope>,
    pub params: Vec<String>,
    pub body: Rc<Block>,
    /// Pose-composition chain built up by `::` on closures (§4.3); applied
    /// after the closure's own body evaluates, preserving capture per the
    /// reference implementation's `Closure.__matmul__`.
    pub pose_chain: Vec<PoseChainLink>,
    /// Set for a closure built from a `moveDef name(start >--> end):`; names
    /// the store variables the connector's start/end poses are bound to
    /// when the closure is invoked as a motion connector (§4.1).
    pub bound_connector: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub enum PoseChainLink {
    ComposeAfter(Pose),
    ComposeBefore(Pose),
    ComposeClosure(Rc<Closure>),
}

impl PartialEq for Closure {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.scope, &other.scope) && Rc::ptr_eq(&self.body, &other.body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub name: String,
    pub graph: Rc<std::cell::RefCell<FrameGraph>>,
}

/// An opaque handle into the robot cell, identified by device id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
}

#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(Float),
    Bool(bool),
    String(String),
    Vector3(Vector3),
    Pose(Pose),
    Tuple(Vec<Value>),
    Record(Record),
    Frame(Frame),
    Closure(Rc<Closure>),
    Device(Device),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as Float == *b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Vector3(a), Value::Vector3(b)) => a == b,
            (Value::Pose(a), Value::Pose(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Frame(a), Value::Frame(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => a == b,
            (Value::Device(a), Value::Device(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Bool(_) => "Bool",
            Value::String(_) => "String",
            Value::Vector3(_) => "Vector3",
            Value::Pose(_) => "Pose",
            Value::Tuple(_) => "Tuple",
            Value::Record(_) => "Record",
            Value::Frame(_) => "Frame",
            Value::Closure(_) => "Closure",
            Value::Device(_) => "Device",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            _ => true,
        }
    }

    pub fn as_float(&self) -> Option<Float> {
        match self {
            Value::Int(i) => Some(*i as Float),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_vector3(&self) -> Option<Vector3> {
        match self {
            Value::Vector3(v) => Some(*v),
            Value::Tuple(items) if items.len() == 3 => {
                let x = items[0].as_float()?;
                let y = items[1].as_float()?;
                let z = items[2].as_float()?;
                Some(Vector3::new(x, y, z))
            }
            _ => None,
        }
    }

    pub fn as_pose(&self) -> Option<Pose> {
        match self {
            Value::Pose(p) => Some(*p),
            Value::Tuple(items) if items.len() == 6 => {
                let nums: Option<Vec<Float>> = items.iter().map(Value::as_float).collect();
                let nums = nums?;
                Some(Pose::new(Vector3::new(nums[0], nums[1], nums[2]), Vector3::new(nums[3], nums[4], nums[5])))
            }
            _ => None,
        }
    }

    fn type_error(&self, op: &str, rhs: &Value, range: SourceRange) -> WandelscriptError {
        WandelscriptError::ty(
            range,
            format!("unsupported operand types for {op}: '{}' and '{}'", self.type_name(), rhs.type_name()),
        )
    }

    pub fn add(&self, rhs: &Value, range: SourceRange) -> Result<Value, WandelscriptError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                Ok(Value::Float(self.as_float().unwrap() + rhs.as_float().unwrap()))
            }
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Vector3(a), Value::Vector3(b)) => Ok(Value::Vector3(a.add(*b))),
            (Value::Pose(a), Value::Pose(b)) => Ok(Value::Pose(Pose {
                position: a.position.add(b.position),
                orientation: a.orientation.add(b.orientation),
            })),
            _ => Err(self.type_error("+", rhs, range)),
        }
    }

    pub fn sub(&self, rhs: &Value, range: SourceRange) -> Result<Value, WandelscriptError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a - b)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                Ok(Value::Float(self.as_float().unwrap() - rhs.as_float().unwrap()))
            }
            (Value::Vector3(a), Value::Vector3(b)) => Ok(Value::Vector3(a.sub(*b))),
            (Value::Pose(a), Value::Pose(b)) => Ok(Value::Pose(Pose {
                position: a.position.sub(b.position),
                orientation: a.orientation.sub(b.orientation),
            })),
            _ => Err(self.type_error("-", rhs, range)),
        }
    }

    pub fn mul(&self, rhs: &Value, range: SourceRange) -> Result<Value, WandelscriptError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                Ok(Value::Float(self.as_float().unwrap() * rhs.as_float().unwrap()))
            }
            (Value::Vector3(v), Value::Int(_) | Value::Float(_)) => Ok(Value::Vector3(v.scale(rhs.as_float().unwrap()))),
            (Value::Int(_) | Value::Float(_), Value::Vector3(v)) => Ok(Value::Vector3(v.scale(self.as_float().unwrap()))),
            _ => Err(self.type_error("*", rhs, range)),
        }
    }

    pub fn div(&self, rhs: &Value, range: SourceRange) -> Result<Value, WandelscriptError> {
        match (self, rhs) {
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let b = rhs.as_float().unwrap();
                if b == 0.0 {
                    return Err(WandelscriptError::ty(range, "division by zero"));
                }
                Ok(Value::Float(self.as_float().unwrap() / b))
            }
            _ => Err(self.type_error("/", rhs, range)),
        }
    }

    /// `::`: pose/closure composition (§4.3). Vector3 `::` Vector3 is vector
    /// addition; Pose `::` Vector3 re-attaches the left pose's orientation.
    pub fn compose(&self, rhs: &Value, range: SourceRange) -> Result<Value, WandelscriptError> {
        match (self, rhs) {
            (Value::Pose(a), Value::Pose(b)) => Ok(Value::Pose(a.compose(*b))),
            (Value::Pose(a), Value::Vector3(b)) => Ok(Value::Pose(Pose::new(a.position.add(*b), a.orientation))),
            (Value::Vector3(a), Value::Vector3(b)) => Ok(Value::Vector3(a.add(*b))),
            (Value::Closure(a), Value::Closure(b)) => Ok(Value::Closure(Rc::new(compose_closures(a, b)))),
            (Value::Pose(p), Value::Closure(c)) => {
                let mut chain = vec![PoseChainLink::ComposeBefore(*p)];
                chain.extend(c.pose_chain.clone());
                Ok(Value::Closure(Rc::new(Closure { scope: c.scope.clone(), params: c.params.clone(), body: c.body.clone(), pose_chain: chain, bound_connector: c.bound_connector.clone() })))
            }
            (Value::Closure(c), Value::Pose(p)) => {
                let mut chain = c.pose_chain.clone();
                chain.push(PoseChainLink::ComposeAfter(*p));
                Ok(Value::Closure(Rc::new(Closure { scope: c.scope.clone(), params: c.params.clone(), body: c.body.clone(), pose_chain: chain, bound_connector: c.bound_connector.clone() })))
            }
            _ => Err(self.type_error("::", rhs, range)),
        }
    }

    pub fn invert(&self, range: SourceRange) -> Result<Value, WandelscriptError> {
        match self {
            Value::Pose(p) => Ok(Value::Pose(p.inverse())),
            Value::Bool(b) => Ok(Value::Bool(!b)),
            Value::Int(i) => Ok(Value::Int(!i)),
            other => Err(WandelscriptError::ty(range, format!("unsupported operand type for ~: '{}'", other.type_name()))),
        }
    }

    pub fn negate(&self, range: SourceRange) -> Result<Value, WandelscriptError> {
        match self {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Vector3(v) => Ok(Value::Vector3(v.scale(-1.0))),
            other => Err(WandelscriptError::ty(range, format!("unsupported operand type for unary -: '{}'", other.type_name()))),
        }
    }

    pub fn compare(&self, rhs: &Value, range: SourceRange, op: crate::ast::BinOp) -> Result<Value, WandelscriptError> {
        use crate::ast::BinOp::*;
        match op {
            Eq => return Ok(Value::Bool(self == rhs)),
            Ne => return Ok(Value::Bool(self != rhs)),
            _ => {}
        }
        let (a, b) = match (self.as_float(), rhs.as_float()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(self.type_error("comparison", rhs, range)),
        };
        let result = match op {
            Lt => a < b,
            Le => a <= b,
            Gt => a > b,
            Ge => a >= b,
            _ => unreachable!(),
        };
        Ok(Value::Bool(result))
    }
}

fn compose_closures(a: &Closure, b: &Closure) -> Closure {
    let mut chain = a.pose_chain.clone();
    chain.push(PoseChainLink::ComposeClosure(Rc::new(b.clone())));
    Closure { scope: a.scope.clone(), params: a.params.clone(), body: a.body.clone(), pose_chain: chain, bound_connector: a.bound_connector.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceRange;

    fn r() -> SourceRange {
        SourceRange::default()
    }

    #[test]
    fn vector_addition() {
        let a = Value::Vector3(Vector3::new(0.0, 1.0, 2.0));
        let b = Value::Vector3(Vector3::new(0.0, 0.0, 3.0));
        let result = a.add(&b, r()).unwrap();
        assert_eq!(result, Value::Vector3(Vector3::new(0.0, 1.0, 5.0)));
    }

    #[test]
    fn pose_composition_with_inverse_is_identity() {
        let pose = Value::Pose(Pose::new(Vector3::new(0.0, 0.0, 5.0), Vector3::new(0.0, 0.0, 1.0)));
        let inv = pose.invert(r()).unwrap();
        let composed = pose.compose(&inv, r()).unwrap();
        if let Value::Pose(p) = composed {
            assert!(p.approx_eq(Pose::identity(), 1e-6));
        } else {
            panic!("expected pose");
        }
    }

    #[test]
    fn pose_composition_with_inverse_is_identity_for_non_axis_aligned_orientation() {
        // A linearized (cross-product) rotation approximation masks the bug this
        // guards against: it only vanishes for axis-aligned position/orientation pairs.
        let pose = Value::Pose(Pose::new(Vector3::new(0.0, 0.0, 1.0), Vector3::new(1.0, 0.0, 0.0)));
        let inv = pose.invert(r()).unwrap();
        let composed = pose.compose(&inv, r()).unwrap();
        if let Value::Pose(p) = composed {
            assert!(p.approx_eq(Pose::identity(), 1e-9));
        } else {
            panic!("expected pose");
        }
    }

    #[test]
    fn mismatched_types_raise_type_error() {
        let a = Value::Pose(Pose::identity());
        let b = Value::Float(2.0);
        assert!(a.mul(&b, r()).is_err());
    }

    #[test]
    fn assoc_leaves_original_record_unchanged() {
        let rec = Record::default().assoc("a", Value::Int(1));
        let updated = rec.assoc("a", Value::Int(2));
        assert_eq!(rec.get("a"), Some(&Value::Int(1)));
        assert_eq!(updated.get("a"), Some(&Value::Int(2)));
    }
}
