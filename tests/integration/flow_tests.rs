use crate::TestDatabase;
use bot_factory::db::{BotFlow, DbError, PersistenceGateway};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;

fn new_flow(flow_id: &str, user_id: i64) -> BotFlow {
    BotFlow {
        flow_id: flow_id.to_string(),
        user_id,
        creator_id: user_id,
        status: "waiting_token".to_string(),
        current_stage: 1,
        bot_token_id: None,
        final_status: None,
        stage_times: HashMap::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        completed_at: None,
    }
}

/// The Stage Guardrail: `current_stage` only ever moves forward, and a
/// regression attempt (without setting a terminal `final_status`) is a no-op.
#[tokio::test]
async fn stage_guardrail_rejects_backward_moves() {
    let test_db = TestDatabase::create_fresh().await.expect("failed to set up test db");
    let db = PersistenceGateway::new(test_db.pool.clone());

    let flow = new_flow("flow_guardrail_1", 1001);
    db.flow_insert(&flow).await.expect("insert flow");
    db.flow_advance(&flow.flow_id, "waiting_description", Some(3), None, None)
        .await
        .expect("advance to stage 3");

    // attempting to move back to stage 2 without a final_status is rejected
    db.flow_advance(&flow.flow_id, "waiting_token", Some(2), None, None)
        .await
        .expect("advance call itself succeeds");

    let reloaded = db.flow_by_id(&flow.flow_id).await.expect("query flow").expect("flow exists");
    assert_eq!(reloaded.current_stage, 3, "stage must not regress");

    // a terminal final_status is allowed to force the stage via GREATEST
    db.flow_advance(&flow.flow_id, "failed", Some(1), None, Some("failed"))
        .await
        .expect("terminal advance");
    let terminal = db.flow_by_id(&flow.flow_id).await.expect("query flow").expect("flow exists");
    assert_eq!(terminal.current_stage, 3, "GREATEST keeps the higher stage even on terminal transitions");
    assert_eq!(terminal.final_status.as_deref(), Some("failed"));

    test_db.cleanup().await.ok();
}

/// One bot_token_id can back at most one flow (partial unique index over
/// non-null bot_token_id).
#[tokio::test]
async fn bot_token_id_collision_is_rejected() {
    let test_db = TestDatabase::create_fresh().await.expect("failed to set up test db");
    let db = PersistenceGateway::new(test_db.pool.clone());

    let flow_a = new_flow("flow_collision_a", 2001);
    let flow_b = new_flow("flow_collision_b", 2002);
    db.flow_insert(&flow_a).await.expect("insert flow a");
    db.flow_insert(&flow_b).await.expect("insert flow b");

    db.flow_advance(&flow_a.flow_id, "waiting_description", Some(3), Some("123456789"), None)
        .await
        .expect("first claim of bot_token_id succeeds");

    let result = db
        .flow_advance(&flow_b.flow_id, "waiting_description", Some(3), Some("123456789"), None)
        .await;
    assert!(matches!(result, Err(DbError::ConstraintViolated(_))));

    test_db.cleanup().await.ok();
}

/// Funnel events with the same event_id are deduplicated (idempotent logging).
#[tokio::test]
async fn duplicate_event_ids_are_ignored() {
    let test_db = TestDatabase::create_fresh().await.expect("failed to set up test db");
    let db = PersistenceGateway::new(test_db.pool.clone());

    for _ in 0..3 {
        db.event_log(Some("activation_flow_x"), 3001, "bot_activated_by_creator", Some("flow_x"), Some("999"), &json!({}))
            .await
            .expect("event log call succeeds");
    }

    let client = test_db.pool.get().await.expect("get client");
    let row = client
        .query_one("SELECT COUNT(*) FROM funnel_events WHERE event_id = 'activation_flow_x'", &[])
        .await
        .expect("count query");
    let count: i64 = row.get(0);
    assert_eq!(count, 1, "idempotency key must prevent duplicate inserts");

    test_db.cleanup().await.ok();
}

/// bot_states round-trips arbitrary JSON under the (bot_id, user_id, key)
/// primary key, with later writes overwriting earlier ones.
#[tokio::test]
async fn handler_state_save_and_load_round_trips() {
    let test_db = TestDatabase::create_fresh().await.expect("failed to set up test db");
    let db = PersistenceGateway::new(test_db.pool.clone());

    db.state_save("bot_abc", "4001", "counter", &json!(1)).await.expect("save 1");
    db.state_save("bot_abc", "4001", "counter", &json!(2)).await.expect("save 2 overwrites");

    let loaded = db.state_load("bot_abc", "4001", "counter").await.expect("load");
    assert_eq!(loaded, Some(json!(2)));

    let missing = db.state_load("bot_abc", "4001", "missing_key").await.expect("load missing");
    assert_eq!(missing, None);

    test_db.cleanup().await.ok();
}

/// Rate-limit counting only considers registrations within the lookback window.
#[tokio::test]
async fn registry_count_created_by_respects_since() {
    let test_db = TestDatabase::create_fresh().await.expect("failed to set up test db");
    let db = PersistenceGateway::new(test_db.pool.clone());

    db.registry_register("111:aaa", "bot_111", 5001).await.expect("register 1");
    db.registry_register("222:bbb", "bot_222", 5001).await.expect("register 2");
    db.registry_register("333:ccc", "bot_333", 5002).await.expect("register other user");

    let since = Utc::now() - chrono::Duration::hours(24);
    let count = db.registry_count_created_by(5001, since).await.expect("count");
    assert_eq!(count, 2);

    let future_since = Utc::now() + chrono::Duration::hours(1);
    let none_yet = db.registry_count_created_by(5001, future_since).await.expect("count none");
    assert_eq!(none_yet, 0);

    test_db.cleanup().await.ok();
}
