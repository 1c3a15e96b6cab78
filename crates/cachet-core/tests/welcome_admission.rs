//! Two-phase welcome admission: confirmation, crash recovery between the
//! phases, and rollback on reported failure.

mod support;

use std::{
    sync::{Arc, atomic::AtomicU32},
    time::Duration,
};

use cachet_core::{CoreError, net::NetError, net::WelcomeOutcome};
use cachet_store::{MemoryStore, Store};
use cachet_types::{ConversationPhase, ConvoId, WelcomePhase};
use support::{FakeServer, invitee_from_server, member, open_context};

fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

async fn create_group_with_bob(
    server: &FakeServer,
    convo: ConvoId,
    bob_ctx: &support::TestContext,
) {
    bob_ctx.orchestrator().publish_key_package().await.unwrap();

    let alice_ctx =
        open_context(MemoryStore::new(), server.clone(), member(1, 1), counter(), 50).unwrap();
    let invitee = invitee_from_server(server, member(2, 1));
    alice_ctx.orchestrator().create(convo, vec![invitee]).await.unwrap();
}

#[tokio::test]
async fn admission_reaches_confirmed() {
    let server = FakeServer::new();
    let convo = ConvoId(200);
    let bob_ctx =
        open_context(MemoryStore::new(), server.clone(), member(2, 1), counter(), 51).unwrap();
    create_group_with_bob(&server, convo, &bob_ctx).await;

    let welcome = server.welcome_for(convo).unwrap();
    bob_ctx.welcome().on_received(convo, welcome).unwrap();
    bob_ctx.welcome().run(convo).await.unwrap();

    assert_eq!(server.confirmations(convo), vec![WelcomeOutcome::Success]);

    // Conversation is live, pending record is gone.
    let record = bob_ctx.store().conversation(bob_ctx.principal(), convo).unwrap().unwrap();
    assert_eq!(record.phase, ConversationPhase::Active);
    assert_eq!(record.epoch, 1);
    assert!(bob_ctx.store().welcome(bob_ctx.principal(), convo).unwrap().is_none());

    // The join epoch's secret was recorded during admission.
    assert!(bob_ctx.orchestrator().ledger().has(convo, 1).unwrap());
}

/// Crash between Phase 1 and Phase 2: the restart re-attempts Phase 2 only
/// with the recorded outcome and the same token, and does not consume a
/// second key package.
#[tokio::test]
async fn crash_between_phases_retries_phase_two_only() {
    let server = FakeServer::new();
    let convo = ConvoId(201);
    let bob = member(2, 1);
    let store = MemoryStore::new();
    let welcomes_processed = counter();

    let bob_ctx =
        open_context(store.clone(), server.clone(), bob, welcomes_processed.clone(), 52).unwrap();
    create_group_with_bob(&server, convo, &bob_ctx).await;

    let welcome = server.welcome_for(convo).unwrap();
    bob_ctx.welcome().on_received(convo, welcome).unwrap();

    // Confirmation cannot reach the server: Phase 1 completes, Phase 2
    // fails through the whole retry budget (4 attempts).
    server.fail_next("confirm_welcome", NetError::Timeout(Duration::from_secs(1)), 4);
    let err = bob_ctx.welcome().run(convo).await.unwrap_err();
    assert!(matches!(err, CoreError::Network(_)));

    // The durable Phase 1 outcome survived.
    let pending = bob_ctx.store().welcome(bob.principal, convo).unwrap().unwrap();
    assert_eq!(pending.phase, WelcomePhase::Joined);
    assert_eq!(welcomes_processed.load(std::sync::atomic::Ordering::SeqCst), 1);
    drop(bob_ctx);

    // "Restart": fresh context over the same store; the engine restores
    // from the snapshot persisted during Phase 1.
    let server_healthy = server.clone();
    let bob_ctx =
        open_context(store, server_healthy, bob, welcomes_processed.clone(), 53).unwrap();
    let unresolved = bob_ctx.resume().await.unwrap();
    assert!(unresolved.is_empty(), "resume must settle the admission: {unresolved:?}");

    // Confirmed, with Phase 1 run exactly once over both processes.
    assert_eq!(server.confirmations(convo), vec![WelcomeOutcome::Success]);
    assert_eq!(welcomes_processed.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Every confirm attempt, pre- and post-crash, carried the same token.
    let tokens = server.tokens_for("confirm_welcome");
    assert!(tokens.len() > 1);
    assert!(tokens.iter().all(|t| *t == tokens[0]), "confirm token must be stable");
}

/// A welcome that cannot be processed is reported as failed and all local
/// Phase 1 state is rolled back.
#[tokio::test]
async fn failed_processing_reports_and_rolls_back() {
    let server = FakeServer::new();
    let convo = ConvoId(202);
    let bob = member(2, 1);

    // Bob never published a key package from THIS engine: the welcome
    // targets a bundle he does not have (the storage-loss signature).
    let other_bob_ctx =
        open_context(MemoryStore::new(), server.clone(), bob, counter(), 54).unwrap();
    create_group_with_bob(&server, convo, &other_bob_ctx).await;

    let fresh_bob_ctx =
        open_context(MemoryStore::new(), server.clone(), bob, counter(), 55).unwrap();
    let welcome = server.welcome_for(convo).unwrap();
    fresh_bob_ctx.welcome().on_received(convo, welcome).unwrap();

    let err = fresh_bob_ctx.welcome().run(convo).await.unwrap_err();
    assert!(matches!(err, CoreError::KeyPackageDesync { .. }));

    // The failure was reported...
    match server.confirmations(convo).as_slice() {
        [WelcomeOutcome::Failure { reason }] => {
            assert!(reason.contains("key package"), "reason should name the cause: {reason}");
        },
        other => panic!("expected one failure confirmation, got {other:?}"),
    }

    // ...and local state is clean for a retry.
    let principal = fresh_bob_ctx.principal();
    assert!(fresh_bob_ctx.store().conversation(principal, convo).unwrap().is_none());
    assert!(fresh_bob_ctx.store().welcome(principal, convo).unwrap().is_none());
}

/// Redelivered welcomes do not clobber an admission in progress.
#[tokio::test]
async fn redelivery_is_ignored_while_pending() {
    let server = FakeServer::new();
    let convo = ConvoId(203);
    let bob_ctx =
        open_context(MemoryStore::new(), server.clone(), member(2, 1), counter(), 56).unwrap();
    create_group_with_bob(&server, convo, &bob_ctx).await;

    let welcome = server.welcome_for(convo).unwrap();
    bob_ctx.welcome().on_received(convo, welcome.clone()).unwrap();
    let first = bob_ctx.store().welcome(bob_ctx.principal(), convo).unwrap().unwrap();

    bob_ctx.welcome().on_received(convo, welcome).unwrap();
    let second = bob_ctx.store().welcome(bob_ctx.principal(), convo).unwrap().unwrap();

    assert_eq!(first.confirm_token, second.confirm_token, "token must not be re-minted");
}
