//! End-to-end program scenarios (§8), run against the bundled
//! `SimulatedRobotCell` and asserted on the resulting `ProgramRun` the way
//! the reference implementation's own scenario tests do.

use std::sync::Arc;

use wandelscript::robot_cell::SimulatedRobotCell;
use wandelscript::runner::{ProgramRun, ProgramRunState};
use wandelscript::value::Value;

fn cell() -> Arc<SimulatedRobotCell> {
    Arc::new(SimulatedRobotCell::new())
}

fn cell_with_device(id: &str) -> Arc<SimulatedRobotCell> {
    Arc::new(SimulatedRobotCell::new().with_device(id))
}

async fn completed_store(source: &str) -> serde_json::Value {
    let run = ProgramRun::new(source.to_owned(), cell());
    let result = run.run().await;
    assert_eq!(result.state, ProgramRunState::Completed, "program failed: {:?}", result.error);
    result.store
}

#[tokio::test]
async fn int_conversion_truncates_toward_zero() {
    let store = completed_store("a = int(5.63)\n").await;
    assert_eq!(store["a"], serde_json::json!(5));
}

#[tokio::test]
async fn vector_literal_addition() {
    let store = completed_store("a = (0,1,2) + (0,0,3)\n").await;
    assert_eq!(store["a"], serde_json::json!({"x": 0.0, "y": 1.0, "z": 5.0}));
}

#[tokio::test]
async fn pose_composed_with_its_inverse_is_identity() {
    let source = "pose = to_pose((0,0,5), (0,0,1))\nb = ~pose\nc = pose :: b\n";
    let store = completed_store(source).await;
    let c = &store["c"];
    let position = &c["position"];
    assert!((position["x"].as_f64().unwrap()).abs() < 1e-6);
    assert!((position["y"].as_f64().unwrap()).abs() < 1e-6);
    assert!((position["z"].as_f64().unwrap()).abs() < 1e-6);
    let orientation = &c["orientation"];
    assert!((orientation["x"].as_f64().unwrap()).abs() < 1e-6);
    assert!((orientation["y"].as_f64().unwrap()).abs() < 1e-6);
    assert!((orientation["z"].as_f64().unwrap()).abs() < 1e-6);
}

#[tokio::test]
async fn pose_composed_with_its_inverse_is_identity_for_non_axis_aligned_orientation() {
    // position and orientation deliberately point along different axes: a
    // linearized rotation approximation would leave a nonzero residual here.
    let source = "pose = to_pose((0,0,1), (1,0,0))\nb = ~pose\nc = pose :: b\n";
    let store = completed_store(source).await;
    let c = &store["c"];
    let position = &c["position"];
    assert!((position["x"].as_f64().unwrap()).abs() < 1e-9);
    assert!((position["y"].as_f64().unwrap()).abs() < 1e-9);
    assert!((position["z"].as_f64().unwrap()).abs() < 1e-9);
    let orientation = &c["orientation"];
    assert!((orientation["x"].as_f64().unwrap()).abs() < 1e-9);
    assert!((orientation["y"].as_f64().unwrap()).abs() < 1e-9);
    assert!((orientation["z"].as_f64().unwrap()).abs() < 1e-9);
}

#[tokio::test]
async fn inclusive_for_range_sums_three_through_four() {
    let store = completed_store("a = 0\nfor i in 3..5:\n    a = a + i\n").await;
    assert_eq!(store["a"], serde_json::json!(12));
}

#[tokio::test]
async fn exclusive_for_range_sums_three_only() {
    let store = completed_store("a = 0\nfor i in 3..<5:\n    a = a + i\n").await;
    assert_eq!(store["a"], serde_json::json!(7));
}

#[tokio::test]
async fn move_def_with_bound_connector_params_runs_its_body_per_call() {
    let source = "move via ptp() to (0,0,0,0,0,0)\nmovedef circle(start >--> end):\n    move via line() to start :: (0, 1, 0)\n    a = a + 1\n    move via line() to end\na = 0\nmove via circle() to (0, 0, 1, 0, 0, 0)\nmove via circle() to (0, 0, 2, 0, 0, 0)\nsync\n";
    let store = completed_store(source).await;
    assert_eq!(store["a"], serde_json::json!(2));
}

#[tokio::test]
async fn move_sequence_completes_and_reaches_target_pose() {
    let source = "move via ptp() to (0,0,0,0,0,0)\nmove via line() to (0,10,10,0,0,0)\nsync\n";
    let run = ProgramRun::new(source.to_owned(), cell());
    let result = run.run().await;
    assert_eq!(result.state, ProgramRunState::Completed, "program failed: {:?}", result.error);
}

#[tokio::test]
async fn blending_modifier_is_visible_inside_the_with_block() {
    let source = "with blending(20):\n    b = __ms_position_zone_radius\n";
    let store = completed_store(source).await;
    assert_eq!(store["b"], serde_json::json!(20.0));
}

#[tokio::test]
async fn blending_modifier_does_not_leak_out_of_the_with_block() {
    let source = "with blending(20):\n    pass\na = __ms_position_zone_radius\n";
    let run = ProgramRun::new(source.to_owned(), cell());
    let result = run.run().await;
    assert_eq!(result.state, ProgramRunState::Failed);
}

#[tokio::test]
async fn raise_fails_the_run_with_the_message() {
    let run = ProgramRun::new("raise \"boom\"\n".to_owned(), cell());
    let result = run.run().await;
    assert_eq!(result.state, ProgramRunState::Failed);
    assert!(result.error.unwrap().contains("boom"));
}

#[tokio::test]
async fn explicit_sync_inside_a_robot_block_is_a_nested_sync_error() {
    let run = ProgramRun::new("do with \"robot\":\n    sync\n".to_owned(), cell());
    let result = run.run().await;
    assert_eq!(result.state, ProgramRunState::Failed);
    assert!(result.error.unwrap().to_lowercase().contains("sync"));
}

#[tokio::test]
async fn print_output_is_captured_in_the_run_not_on_real_stdout() {
    let run = ProgramRun::new("print(1 + 1)\n".to_owned(), cell());
    let result = run.run().await;
    assert_eq!(result.state, ProgramRunState::Completed);
    assert_eq!(result.stdout, "2\n");
}

#[tokio::test]
async fn assoc_leaves_the_original_record_unchanged() {
    let source = "x = {a: 1}\ny = assoc(x, \"a\", 2)\n";
    let store = completed_store(source).await;
    assert_eq!(store["x"]["a"], serde_json::json!(1));
    assert_eq!(store["y"]["a"], serde_json::json!(2));
}

#[tokio::test]
async fn device_write_then_read_round_trips() {
    let source = "write(\"controller\", \"flag\", true)\nv = read(\"controller\", \"flag\")\n";
    let run = ProgramRun::new(source.to_owned(), cell_with_device("controller"));
    let result = run.run().await;
    assert_eq!(result.state, ProgramRunState::Completed, "program failed: {:?}", result.error);
    assert_eq!(result.store["v"], serde_json::json!(true));
}

#[test]
fn value_module_is_reachable_from_the_public_api() {
    let v = Value::Int(1);
    assert_eq!(v.type_name(), "Int");
}
