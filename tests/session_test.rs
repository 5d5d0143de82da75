//! Chat session behavior over the in-process transport.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{worker_for, Script, ScriptedEngine};
use sealed_llm::client::{
    LocalTransport, ReplyStream, Session, SessionConfig, SessionEnd, Transport, TransportError,
    TurnOutcome,
};
use sealed_llm::engine::{EngineError, StreamShape};
use sealed_llm::envelope::{Role, Turn};
use sealed_llm::security::{Codec, EncryptedBlob, Key};
use sealed_llm::worker::ErrorKind;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

fn session(engine: std::sync::Arc<ScriptedEngine>) -> Session<LocalTransport> {
    let (worker, codec) = worker_for(engine);
    let config = SessionConfig {
        system_prompt: "S".to_string(),
        ..SessionConfig::default()
    };
    Session::new(config, codec, LocalTransport::new(worker))
}

#[tokio::test]
async fn test_history_accumulates_completed_turns() {
    let engine = ScriptedEngine::incremental(&["o", "k"]);
    let mut session = session(engine.clone());
    let mut out = Vec::<u8>::new();

    let first = session.send("a", &mut out).await.unwrap();
    assert_eq!(first, TurnOutcome::Completed("ok".to_string()));
    session.send("b", &mut out).await.unwrap();

    assert_eq!(
        session.history().turns(),
        &[
            Turn::system("S"),
            Turn::user("a"),
            Turn::assistant("ok"),
            Turn::user("b"),
            Turn::assistant("ok"),
        ]
    );
    assert!(session.history().is_well_formed());
    assert_eq!(String::from_utf8(out).unwrap(), "okok");

    // The second request carried the whole conversation so far.
    let seen = engine.requests();
    assert_eq!(seen.len(), 2);
    let roles: Vec<Role> = seen[1].conversation.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
}

#[tokio::test]
async fn test_rejected_turn_commits_nothing() {
    let engine = ScriptedEngine::new(
        StreamShape::Incremental,
        Script::FailStart(EngineError::Backend("busy".into())),
    );
    let mut session = session(engine);
    let mut out = Vec::<u8>::new();

    let outcome = session.send("a", &mut out).await.unwrap();
    assert!(matches!(
        outcome,
        TurnOutcome::Rejected { kind: Some(ErrorKind::EngineError), .. }
    ));
    assert_eq!(session.history().turns(), &[Turn::system("S")]);
}

#[tokio::test]
async fn test_mid_stream_error_discards_partial_reply() {
    let engine = ScriptedEngine::new(
        StreamShape::Incremental,
        Script::Items(vec![Ok("half".into()), Err(EngineError::Protocol("eof".into()))]),
    );
    let mut session = session(engine);
    let mut out = Vec::<u8>::new();

    let outcome = session.send("a", &mut out).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Rejected { .. }));
    assert_eq!(session.history().len(), 1);
    assert_eq!(String::from_utf8(out).unwrap(), "half");
}

#[tokio::test]
async fn test_key_mismatch_is_reported_as_security_error() {
    let (worker, _) = worker_for(ScriptedEngine::incremental(&["never"]));
    let mut session = Session::new(
        SessionConfig::default(),
        Codec::new(&Key::generate()),
        LocalTransport::new(worker),
    );
    let outcome = session.send("a", &mut Vec::<u8>::new()).await.unwrap();
    assert!(matches!(
        outcome,
        TurnOutcome::Rejected { kind: Some(ErrorKind::SecurityError), .. }
    ));
}

#[tokio::test]
async fn test_run_stops_at_exit_command() {
    let mut session = session(ScriptedEngine::incremental(&["ok"]));
    let input: &[u8] = b"hi\n\n   \nQUIT\nnever sent\n";
    let mut out = Vec::<u8>::new();

    let end = session
        .run(input, &mut out, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::Exited);
    assert_eq!(session.history().len(), 3);
    assert!(String::from_utf8(out).unwrap().contains("ok"));
}

#[tokio::test]
async fn test_run_ends_at_end_of_input() {
    let mut session = session(ScriptedEngine::incremental(&["ok"]));
    let input: &[u8] = b"one\ntwo\n";
    let end = session
        .run(input, &mut Vec::<u8>::new(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::EndOfInput);
    assert_eq!(session.history().len(), 5);
}

#[tokio::test]
async fn test_run_continues_after_rejected_turn() {
    let engine = ScriptedEngine::new(
        StreamShape::Incremental,
        Script::FailStart(EngineError::Backend("busy".into())),
    );
    let mut session = session(engine.clone());
    let input: &[u8] = b"one\ntwo\n";
    let mut out = Vec::<u8>::new();
    let end = session
        .run(input, &mut out, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::EndOfInput);
    assert_eq!(engine.requests().len(), 2);
    assert_eq!(session.history().len(), 1);
    assert!(String::from_utf8(out).unwrap().contains("[engine_error]"));
}

#[tokio::test]
async fn test_interrupt_ends_session_without_committing() {
    let engine = ScriptedEngine::new(StreamShape::Incremental, Script::Hang(vec!["par".into()]));
    let mut session = session(engine);
    let interrupt = CancellationToken::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let input: &[u8] = b"hello\n";
    let mut out = Vec::<u8>::new();
    let end = tokio::time::timeout(Duration::from_secs(5), session.run(input, &mut out, interrupt))
        .await
        .expect("interrupt was not honored")
        .unwrap();
    assert_eq!(end, SessionEnd::Interrupted);
    assert_eq!(session.history().turns(), &[Turn::system("S")]);
    assert!(session.history().is_well_formed());
}

/// Fails the first `failures` submissions, then delegates.
struct FlakyTransport {
    failures: AtomicUsize,
    inner: LocalTransport,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn submit(&self, blob: EncryptedBlob) -> Result<ReplyStream, TransportError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::Http("connection refused".to_string()));
        }
        self.inner.submit(blob).await
    }
}

#[tokio::test]
async fn test_transport_failure_is_reported_and_loop_continues() {
    let engine = ScriptedEngine::incremental(&["ok"]);
    let (worker, codec) = worker_for(engine.clone());
    let transport = FlakyTransport {
        failures: AtomicUsize::new(1),
        inner: LocalTransport::new(worker),
    };
    let config = SessionConfig {
        system_prompt: "S".to_string(),
        ..SessionConfig::default()
    };
    let mut session = Session::new(config, codec, transport);

    let input: &[u8] = b"one\ntwo\n";
    let mut out = Vec::<u8>::new();
    let end = session
        .run(input, &mut out, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(end, SessionEnd::EndOfInput);
    let printed = String::from_utf8(out).unwrap();
    assert!(printed.contains("[error]"));
    assert!(printed.contains("connection refused"));
    assert_eq!(engine.requests().len(), 1);
    assert_eq!(
        session.history().turns(),
        &[Turn::system("S"), Turn::user("two"), Turn::assistant("ok")]
    );
}

#[tokio::test]
async fn test_lines_split_across_reads() {
    let mut session = session(ScriptedEngine::incremental(&["ok"]));
    let input = tokio_test::io::Builder::new()
        .read(b"he")
        .read(b"llo\nqu")
        .read(b"it\n")
        .build();
    let end = session
        .run(BufReader::new(input), &mut Vec::<u8>::new(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::Exited);
    assert_eq!(session.history().turns()[1], Turn::user("hello"));
    assert_eq!(session.history().len(), 3);
}
