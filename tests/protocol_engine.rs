//! Command/reply exchanges against a simulated device

mod common;

use common::fake_device;
use serialcal_core::core::protocol::{ProtocolEngine, ProtocolError, ReplyMode};
use serialcal_core::RuntimeContext;
use std::time::Duration;

#[tokio::test]
async fn test_silent_device_reports_no_response() {
    let mut device = fake_device(|_, _| None);
    let ctx = RuntimeContext::default();

    let err = ProtocolEngine::new(&mut device, &ctx)
        .send_and_collect("I", Duration::from_millis(1000), Duration::ZERO, ReplyMode::FirstLine)
        .await
        .unwrap_err();

    match err {
        ProtocolError::NoResponse { elapsed_ms } => assert!(elapsed_ms >= 1000),
        other => panic!("expected NoResponse, got {other:?}"),
    }
}

#[tokio::test]
async fn test_retransmits_until_device_answers() {
    // ignores the first two transmissions
    let mut device = fake_device(|line, count| {
        (line == "E 0" && count >= 2).then(|| b"E 0\r\nECHO is now OFF\r\n".to_vec())
    });
    let ctx = RuntimeContext::default();

    let mut engine = ProtocolEngine::new(&mut device, &ctx);
    let reply = engine
        .send_and_collect(
            "E 0",
            Duration::from_millis(5000),
            Duration::from_millis(1000),
            ReplyMode::FirstLine,
        )
        .await
        .unwrap();

    assert_eq!(reply, "ECHO is now OFF");
    assert_eq!(engine.transmissions(), 3);
}

#[tokio::test]
async fn test_boot_noise_does_not_stop_retransmission() {
    // a stray byte after boot, then silence, then the real answer
    let mut device = fake_device(|line, count| match (line, count) {
        ("E 0", 0) => Some(b"\xff".to_vec()),
        ("E 0", 1) => None,
        ("E 0", _) => Some(b"E 0\r\nECHO is now OFF\r\n".to_vec()),
        _ => None,
    });
    let ctx = RuntimeContext::default();

    let mut engine = ProtocolEngine::new(&mut device, &ctx);
    let reply = engine
        .send_and_collect(
            "E 0",
            Duration::from_millis(5000),
            Duration::from_millis(1000),
            ReplyMode::FirstLine,
        )
        .await
        .unwrap();

    assert_eq!(reply, "ECHO is now OFF");
    assert_eq!(engine.transmissions(), 3);
}

#[tokio::test]
async fn test_unterminated_reply_times_out() {
    let mut device = fake_device(|line, _| (line == "V").then(|| b"1.0".to_vec()));
    let ctx = RuntimeContext::default();

    let err = ProtocolEngine::new(&mut device, &ctx)
        .send_and_collect("V", Duration::from_millis(500), Duration::ZERO, ReplyMode::FirstLine)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_echo_is_skipped() {
    let mut device = fake_device(|line, _| (line == "PING").then(|| b"PING\r\nPONG\r\n".to_vec()));
    let ctx = RuntimeContext::default();

    let reply = ProtocolEngine::new(&mut device, &ctx)
        .send_command_get_reply("PING")
        .await
        .unwrap();
    assert_eq!(reply, "PONG");
}

#[tokio::test]
async fn test_send_ok() {
    let mut device = fake_device(|line, _| match line {
        "C 2" => Some(b"OK\r\n".to_vec()),
        "C 9" => Some(b"ERROR\r\n".to_vec()),
        _ => None,
    });
    let ctx = RuntimeContext::default();

    let mut engine = ProtocolEngine::new(&mut device, &ctx);
    assert!(engine.send_ok("C 2").await);
    assert!(!engine.send_ok("C 9").await);
}
