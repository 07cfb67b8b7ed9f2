//! JSON encoding of runtime values (§6.1), grounded on the reference
//! implementation's `encode_for_json`/`decode_from_json` pair: `Vector3` and
//! `Pose` get a fixed object shape, tuples become arrays, records become
//! plain objects, and non-finite floats are dropped rather than serialized
//! as `null` so a `ProgramRun`'s store stays valid JSON.

use serde_json::{Map, Number, Value as Json};

use crate::value::{Pose, Record, Value, Vector3};

pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Int(i) => Json::Number((*i).into()),
        Value::Float(f) => finite_number(*f).map(Json::Number).unwrap_or(Json::Null),
        Value::Bool(b) => Json::Bool(*b),
        Value::String(s) => Json::String(s.clone()),
        Value::Vector3(v) => vector3_to_json(*v),
        Value::Pose(p) => pose_to_json(*p),
        Value::Tuple(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Record(record) => record_to_json(record),
        Value::Frame(frame) => Json::String(frame.name.clone()),
        Value::Closure(_) => Json::String("<closure>".to_owned()),
        Value::Device(device) => Json::String(device.id.clone()),
    }
}

fn finite_number(f: f64) -> Option<Number> {
    if f.is_finite() {
        Number::from_f64(f)
    } else {
        None
    }
}

fn vector3_to_json(v: Vector3) -> Json {
    let mut map = Map::new();
    map.insert("x".to_owned(), finite_number(v.x).map(Json::Number).unwrap_or(Json::Null));
    map.insert("y".to_owned(), finite_number(v.y).map(Json::Number).unwrap_or(Json::Null));
    map.insert("z".to_owned(), finite_number(v.z).map(Json::Number).unwrap_or(Json::Null));
    Json::Object(map)
}

fn pose_to_json(p: Pose) -> Json {
    let mut map = Map::new();
    map.insert("position".to_owned(), vector3_to_json(p.position));
    map.insert("orientation".to_owned(), vector3_to_json(p.orientation));
    Json::Object(map)
}

fn record_to_json(record: &Record) -> Json {
    let mut map = Map::new();
    for (key, value) in &record.fields {
        map.insert(key.clone(), value_to_json(value));
    }
    Json::Object(map)
}

/// Decodes a JSON value back into a `Value`, recognizing the `{x,y,z}` and
/// `{position,orientation}` shapes written by `value_to_json` and falling
/// back to `Record`/`Tuple` for everything else (§6.1).
pub fn json_to_value(json: &Json) -> Value {
    match json {
        Json::Null => Value::Bool(false),
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::Tuple(items.iter().map(json_to_value).collect()),
        Json::Object(map) => {
            if let Some(v) = try_vector3(map) {
                return Value::Vector3(v);
            }
            if let (Some(Json::Object(pos)), Some(Json::Object(ori))) = (map.get("position"), map.get("orientation")) {
                if let (Some(p), Some(o)) = (try_vector3(pos), try_vector3(ori)) {
                    return Value::Pose(Pose::new(p, o));
                }
            }
            let fields = map.iter().map(|(k, v)| (k.clone(), json_to_value(v))).collect();
            Value::Record(Record { fields })
        }
    }
}

fn try_vector3(map: &Map<String, Json>) -> Option<Vector3> {
    let x = map.get("x")?.as_f64()?;
    let y = map.get("y")?.as_f64()?;
    let z = map.get("z")?.as_f64()?;
    Some(Vector3::new(x, y, z))
}

/// Serializes a whole store snapshot (name -> value pairs) the way
/// `ProgramRun.data` is reported over the wire.
pub fn store_to_json(entries: &[(String, Value)]) -> Json {
    let mut map = Map::new();
    for (name, value) in entries {
        map.insert(name.clone(), value_to_json(value));
    }
    Json::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector3_round_trips() {
        let v = Value::Vector3(Vector3::new(1.0, 2.0, 3.0));
        let json = value_to_json(&v);
        assert_eq!(json_to_value(&json), v);
    }

    #[test]
    fn pose_round_trips() {
        let p = Value::Pose(Pose::new(Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 0.5)));
        let json = value_to_json(&p);
        assert_eq!(json_to_value(&json), p);
    }

    #[test]
    fn non_finite_floats_become_null() {
        let v = Value::Float(f64::NAN);
        assert_eq!(value_to_json(&v), Json::Null);
    }

    #[test]
    fn record_round_trips_as_object() {
        let record = Record { fields: vec![("a".to_owned(), Value::Int(1))] };
        let json = value_to_json(&Value::Record(record));
        assert!(json.is_object());
    }
}
