mod support;

use agent_engine::{Engine, EngineOptions, MessageType, MIN_MAX_LINE_BYTES};
use support::{scratch_session, LineBackend, PanicBackend};

#[tokio::test]
async fn oversized_line_surfaces_one_error_and_ends_the_session() {
    // Emit twice the scanner cap with no newline.
    let command = format!(
        "head -c {} /dev/zero | tr '\\0' 'A'",
        MIN_MAX_LINE_BYTES * 2
    );
    let backend = LineBackend::new("sh", &["-c", &command]);
    let options = EngineOptions::new().max_line_bytes(MIN_MAX_LINE_BYTES);
    let engine = Engine::with_options(backend, options);
    let (session, _dir) = scratch_session("overflow");
    let process = engine.start(session).await.expect("start");

    let output = process.output();
    let error_message = output.recv().await.expect("overflow breadcrumb");
    assert_eq!(error_message.message_type, MessageType::ERROR);
    assert!(error_message.content.contains("scanner"));
    assert!(output.recv().await.is_none());

    let error = process.err().expect("terminal error");
    assert!(error.to_string().contains("scanner"));
    assert!(process.wait().await.is_err());
}

#[tokio::test]
async fn parser_panic_is_fatal_and_kills_the_child() {
    let backend = PanicBackend::new("sh", &["-c", "echo boom; sleep 30"]);
    let engine = Engine::new(backend);
    let (session, _dir) = scratch_session("panic");
    let process = engine.start(session).await.expect("start");

    let output = process.output();
    assert!(output.recv().await.is_none());

    let error = process.wait().await.expect_err("terminal error");
    assert!(error.to_string().contains("parser panic"));
}

#[tokio::test]
async fn nonzero_exit_becomes_an_exit_error() {
    let engine = Engine::new(LineBackend::new("sh", &["-c", "echo partial; exit 3"]));
    let (session, _dir) = scratch_session("exit-code");
    let process = engine.start(session).await.expect("start");

    let output = process.output();
    assert_eq!(output.recv().await.expect("partial").content, "partial");
    assert!(output.recv().await.is_none());

    let error = process.wait().await.expect_err("exit error");
    assert_eq!(error.exit_code(), Some(3));
    // The snapshot is stable.
    assert_eq!(process.err().expect("snapshot").exit_code(), Some(3));
    assert_eq!(process.err().expect("snapshot").exit_code(), Some(3));
}

#[tokio::test]
async fn send_after_failed_exit_reports_terminated() {
    let engine = Engine::new(LineBackend::new("sh", &["-c", "exit 7"]));
    let (session, _dir) = scratch_session("send-after-failure");
    let process = engine.start(session).await.expect("start");

    let output = process.output();
    while output.recv().await.is_some() {}
    assert!(process.wait().await.is_err());

    let error = process
        .send(agent_engine::Message::text("anyone there?"))
        .await
        .expect_err("send on failed session");
    assert!(error.is_terminated());
}
