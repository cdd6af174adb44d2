//! Discovery and session lifecycle against simulated boards

mod common;

use boardmon_core::core::registry::UNKNOWN_DEVICE;
use boardmon_core::{AutoConnect, DeviceTemplates, EngineError, EngineEvent, PortInfo, SessionState};
use common::{quick_config, Rig};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const UNO: &str = "/dev/ttyACM0";
const ESP: &str = "/dev/ttyUSB0";
const MYSTERY: &str = "/dev/ttyUSB1";

fn plug_three(rig: &Rig) {
    rig.bus.plug(PortInfo::usb(UNO, 0x2341, 0x0043), DeviceTemplates::echo());
    rig.bus.plug(PortInfo::usb(ESP, 0x10C4, 0xEA60), DeviceTemplates::ping_pong());
    rig.bus.plug(PortInfo::usb(MYSTERY, 0xFFFF, 0x0001), DeviceTemplates::echo());
}

#[tokio::test]
async fn three_ports_classified_and_unplug_closes_only_that_session() {
    let mut rig = Rig::new(quick_config());
    plug_three(&rig);

    let diff = assert_ok!(rig.engine.scan_now().await);
    assert_eq!(diff.attached.len(), 3);

    let sessions = rig.engine.sessions();
    assert_eq!(sessions.len(), 3);
    assert!(sessions.iter().all(|s| s.state.is_connected()));

    let board = |port: &str| {
        sessions
            .iter()
            .find(|s| s.port_id == port)
            .map(|s| s.board.clone())
            .unwrap()
    };
    assert_eq!(board(UNO), "Arduino Uno");
    assert_eq!(board(ESP), "ESP32 (Silicon Labs CP210x)");
    assert_eq!(board(MYSTERY), UNKNOWN_DEVICE);

    rig.drain();
    assert!(rig.bus.unplug(MYSTERY));
    let diff = assert_ok!(rig.engine.scan_now().await);
    assert_eq!(diff.detached, vec![MYSTERY.to_string()]);

    let detached = rig
        .next_event(Duration::from_secs(1), |e| matches!(e, EngineEvent::Detached { .. }))
        .await;
    assert!(detached.is_some());

    assert_eq!(assert_ok!(rig.engine.session(MYSTERY)).state, SessionState::Disconnected);
    assert!(assert_ok!(rig.engine.session(UNO)).state.is_connected());
    assert!(assert_ok!(rig.engine.session(ESP)).state.is_connected());

    let open = rig.engine.session_table().open_sessions();
    let mut open_ports: Vec<_> = open.iter().map(|s| s.port_id().to_string()).collect();
    open_ports.sort();
    assert_eq!(open_ports, vec![UNO.to_string(), ESP.to_string()]);
}

#[tokio::test]
async fn known_policy_skips_unknown_boards() {
    let mut config = quick_config();
    config.discovery.auto_connect = AutoConnect::Known;
    let rig = Rig::new(config);
    plug_three(&rig);

    assert_ok!(rig.engine.scan_now().await);
    assert_eq!(rig.engine.sessions().len(), 2);
    assert!(!rig.bus.is_open(MYSTERY));
    assert_eq!(rig.engine.ports().len(), 3);
}

#[tokio::test]
async fn io_failure_ends_only_its_session() {
    let mut rig = Rig::new(quick_config());
    plug_three(&rig);
    assert_ok!(rig.engine.scan_now().await);

    assert!(rig.bus.break_link(UNO));
    let failed = rig
        .next_event(Duration::from_secs(2), |e| matches!(e, EngineEvent::SessionFailed { .. }))
        .await;
    match failed {
        Some(EngineEvent::SessionFailed { port_id, .. }) => assert_eq!(port_id, UNO),
        other => panic!("expected session failure, got {other:?}"),
    }

    let uno = assert_ok!(rig.engine.session(UNO));
    assert_eq!(uno.state, SessionState::Error);
    assert!(uno.failure.is_some());

    // The other boards keep working
    let reply = assert_ok!(
        rig.engine
            .send_text(
                ESP,
                "PING",
                Some(boardmon_core::LinePattern::literal("PONG").unwrap()),
                Some(Duration::from_secs(1)),
            )
            .await
    );
    assert_eq!(reply.response.unwrap().text(), "PONG");

    let err = assert_err!(rig.engine.send_text(UNO, "PING", None, None).await);
    assert!(matches!(err, EngineError::SessionNotConnected(_)));
}

#[tokio::test]
async fn failed_open_leaves_session_in_error() {
    let mut config = quick_config();
    config.discovery.auto_connect = AutoConnect::Never;
    let rig = Rig::new(config);
    plug_three(&rig);
    assert_ok!(rig.engine.scan_now().await);

    rig.bus.fail_next_open(ESP, "permission denied");
    let err = assert_err!(rig.engine.connect(ESP).await);
    assert!(matches!(err, EngineError::PortUnavailable { .. }));
    assert_eq!(assert_ok!(rig.engine.session(ESP)).state, SessionState::Error);

    // No automatic retry, but an explicit connect works again
    assert_ok!(rig.engine.connect(ESP).await);
    assert!(assert_ok!(rig.engine.session(ESP)).state.is_connected());
    assert_ok!(rig.engine.connect(UNO).await);
}

#[tokio::test]
async fn line_timestamps_never_go_back() {
    let mut rig = Rig::new(quick_config());
    rig.bus.plug(PortInfo::usb(UNO, 0x2341, 0x0043), DeviceTemplates::echo());
    assert_ok!(rig.engine.scan_now().await);
    rig.drain();

    for i in 0..50 {
        assert!(rig.bus.inject(UNO, &format!("line {i}")));
        if i % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let mut lines = Vec::new();
    while lines.len() < 50 {
        match rig
            .next_event(Duration::from_secs(2), |e| matches!(e, EngineEvent::RawLine(_)))
            .await
        {
            Some(EngineEvent::RawLine(line)) => lines.push(line),
            _ => break,
        }
    }

    assert_eq!(lines.len(), 50);
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(line.text(), format!("line {i}"));
    }
    assert!(lines.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}
