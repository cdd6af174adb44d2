//! Script tasks running against simulated boards

mod common;

use boardmon_core::config::RuleBinding;
use boardmon_core::core::simulator::{MatchCondition, ResponseAction, ResponseRule};
use boardmon_core::{
    Condition, DeviceTemplates, EngineEvent, ExtractionRule, LinePattern, MetricPredicate, MetricValue, PortInfo,
    ScriptBuilder, ScriptTask, SessionState, TaskState, VirtualDevice,
};
use common::{quick_config, Rig};
use std::io::Write;
use std::time::Duration;
use tokio_test::assert_ok;

const BOARD: &str = "/dev/ttyACM0";
const OTHER: &str = "/dev/ttyACM1";

/// Answers PING with PONG after 300 ms
fn slow_pong() -> VirtualDevice {
    VirtualDevice::new("slow pong").with_rule(ResponseRule::new(
        "ping",
        MatchCondition::Exact { text: "PING".into() },
        ResponseAction::Sequence {
            actions: vec![
                ResponseAction::Delay { ms: 300 },
                ResponseAction::SendLine { text: "PONG".into() },
            ],
        },
    ))
}

fn temp_rig() -> Rig {
    let mut config = quick_config();
    config.rules.push(RuleBinding {
        family: None,
        rule: ExtractionRule::number("temp", r"TEMP:(\d+)").unwrap(),
    });
    let rig = Rig::new(config);
    rig.bus.plug(PortInfo::usb(BOARD, 0x2E8A, 0x0005), VirtualDevice::new("silent"));
    rig
}

#[tokio::test]
async fn ping_then_wait_for_pong_completes() {
    let rig = Rig::new(quick_config());
    rig.bus.plug(PortInfo::usb(BOARD, 0x2341, 0x0043), slow_pong());
    assert_ok!(rig.engine.scan_now().await);

    let task = ScriptBuilder::new("ping")
        .send(BOARD, "PING")
        .wait_for_line(BOARD, LinePattern::literal("PONG").unwrap(), Duration::from_secs(2))
        .build();
    let id = rig.engine.run_script(task);
    let status = assert_ok!(rig.engine.wait_task(id).await);

    assert_eq!(status.state, TaskState::Completed, "error: {:?}", status.error);
    assert_eq!(status.total_steps, 2);
    assert!(status.finished_at.is_some());
    assert_eq!(rig.bus.received(BOARD), vec!["PING".to_string()]);
}

#[tokio::test]
async fn wait_for_metric_completes_on_second_reading() {
    let rig = temp_rig();
    assert_ok!(rig.engine.scan_now().await);

    let task = ScriptBuilder::new("overheat")
        .wait_for_metric(BOARD, "temp", MetricPredicate::Gt(100.0), Duration::from_secs(1))
        .build();
    let id = rig.engine.run_script(task);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(rig.bus.inject(BOARD, "TEMP:45"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.engine.task_status(id).unwrap().state, TaskState::Waiting);

    assert!(rig.bus.inject(BOARD, "TEMP:120"));
    let status = assert_ok!(rig.engine.wait_task(id).await);
    assert_eq!(status.state, TaskState::Completed, "error: {:?}", status.error);

    let latest = assert_ok!(rig.engine.latest_metrics(BOARD));
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].value, MetricValue::Number(120.0));
}

#[tokio::test]
async fn wait_timeout_fails_only_its_task() {
    let rig = temp_rig();
    rig.bus.plug(PortInfo::usb(OTHER, 0x2341, 0x0043), slow_pong());
    assert_ok!(rig.engine.scan_now().await);

    let doomed = ScriptBuilder::new("doomed")
        .wait_for_line(BOARD, LinePattern::literal("NEVER").unwrap(), Duration::from_millis(100))
        .build();
    let fine = ScriptBuilder::new("fine")
        .sleep(Duration::from_millis(150))
        .send(OTHER, "PING")
        .wait_for_line(OTHER, LinePattern::literal("PONG").unwrap(), Duration::from_secs(2))
        .build();

    let doomed = rig.engine.run_script(doomed);
    let fine = rig.engine.run_script(fine);

    let doomed = assert_ok!(rig.engine.wait_task(doomed).await);
    assert_eq!(doomed.state, TaskState::Failed);
    assert!(doomed.error.unwrap().contains("timed out"));

    let fine = assert_ok!(rig.engine.wait_task(fine).await);
    assert_eq!(fine.state, TaskState::Completed, "error: {:?}", fine.error);

    // Script failures never touch sessions
    assert!(assert_ok!(rig.engine.session(BOARD)).state.is_connected());
}

#[tokio::test]
async fn cancel_stops_waiting_task_and_keeps_session() {
    let mut rig = temp_rig();
    assert_ok!(rig.engine.scan_now().await);
    rig.drain();

    let task = ScriptBuilder::new("patient")
        .wait_for_line(BOARD, LinePattern::literal("NEVER").unwrap(), Duration::from_secs(30))
        .build();
    let id = rig.engine.run_script(task);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rig.engine.cancel_task(id));

    let status = assert_ok!(tokio::time::timeout(Duration::from_secs(1), rig.engine.wait_task(id)).await).unwrap();
    assert_eq!(status.state, TaskState::Cancelled);
    assert!(!rig.engine.cancel_task(id));

    let session = assert_ok!(rig.engine.session(BOARD));
    assert!(session.state.is_connected());
    let states: Vec<_> = rig
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::TaskStateChanged { state, .. } => Some(state),
            EngineEvent::SessionStateChanged { to, .. } => {
                assert_ne!(to, SessionState::Disconnected);
                None
            }
            _ => None,
        })
        .collect();
    assert_eq!(states.last(), Some(&TaskState::Cancelled));
}

#[tokio::test]
async fn assertion_reads_latest_metric() {
    let rig = temp_rig();
    assert_ok!(rig.engine.scan_now().await);

    assert!(rig.bus.inject(BOARD, "TEMP:80"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cool = ScriptBuilder::new("cool")
        .assert(Condition::metric(BOARD, "temp", MetricPredicate::Lt(100.0)), "too hot")
        .build();
    let hot = ScriptBuilder::new("hot")
        .assert(Condition::metric(BOARD, "temp", MetricPredicate::Gt(100.0)), "not hot yet")
        .build();

    let cool = rig.engine.run_script(cool);
    let hot = rig.engine.run_script(hot);
    assert_eq!(assert_ok!(rig.engine.wait_task(cool).await).state, TaskState::Completed);

    let hot = assert_ok!(rig.engine.wait_task(hot).await);
    assert_eq!(hot.state, TaskState::Failed);
    assert!(hot.error.unwrap().contains("not hot yet"));
}

#[tokio::test]
async fn script_file_runs_against_board() {
    let rig = Rig::new(quick_config());
    rig.bus.plug(PortInfo::usb(BOARD, 0x2341, 0x0043), DeviceTemplates::ping_pong());
    assert_ok!(rig.engine.scan_now().await);

    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(
        file,
        r#"
name: ping-file
steps:
  - step: send
    session: {BOARD}
    payload: PING
    expect: PONG
    timeout_ms: 1000
  - step: assert
    message: board answered
    condition:
      kind: last_line
      session: {BOARD}
      pattern: "^PONG$"
"#
    )
    .unwrap();

    let task: ScriptTask = assert_ok!(rig.engine.load_script(file.path()));
    let id = rig.engine.run_script(task);
    let status = assert_ok!(rig.engine.wait_task(id).await);
    assert_eq!(status.state, TaskState::Completed, "error: {:?}", status.error);
}

#[tokio::test]
async fn run_limit_fails_a_task_whose_steps_fit_their_own_timeouts() {
    let rig = temp_rig();
    assert_ok!(rig.engine.scan_now().await);

    let long = ScriptBuilder::new("long")
        .max_execution(Duration::from_millis(200))
        .sleep(Duration::from_millis(120))
        .wait_for_line(BOARD, LinePattern::literal("NEVER").unwrap(), Duration::from_secs(5))
        .build();
    let started = std::time::Instant::now();
    let id = rig.engine.run_script(long);
    let status = assert_ok!(tokio::time::timeout(Duration::from_secs(2), rig.engine.wait_task(id)).await).unwrap();

    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.current_step, 1);
    assert!(status.error.unwrap().contains("script 'long' to finish"));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(assert_ok!(rig.engine.session(BOARD)).state.is_connected());
}

#[tokio::test]
async fn configured_run_limit_applies_to_tasks_without_one() {
    let mut config = quick_config();
    config.scripting.max_execution_ms = 100;
    let rig = Rig::new(config);
    rig.bus.plug(PortInfo::usb(BOARD, 0x2E8A, 0x0005), VirtualDevice::new("silent"));
    assert_ok!(rig.engine.scan_now().await);

    let limited = ScriptBuilder::new("limited").sleep(Duration::from_millis(400)).build();
    let own_limit = ScriptBuilder::new("own limit")
        .max_execution(Duration::from_secs(5))
        .sleep(Duration::from_millis(200))
        .build();

    let limited = rig.engine.run_script(limited);
    let own_limit = rig.engine.run_script(own_limit);

    let limited = assert_ok!(rig.engine.wait_task(limited).await);
    assert_eq!(limited.state, TaskState::Failed);
    let own_limit = assert_ok!(rig.engine.wait_task(own_limit).await);
    assert_eq!(own_limit.state, TaskState::Completed, "error: {:?}", own_limit.error);
}
