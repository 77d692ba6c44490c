mod support;

use httpmock::prelude::*;
use scraper_gateway::store::TokenState;
use serde_json::json;

/// Scripted upstream walks instrumentation → identifier → password →
/// success; the warmed session leaves a working token state and the fresh
/// session cookie persisted on the account.
#[tokio::test]
async fn interactive_login_flow_warms_a_session() {
    let server = MockServer::start_async().await;
    let h = support::gateway(&server.base_url(), 1);
    h.state
        .store
        .add(vec![support::Harness::credential("alice", None)])
        .unwrap();

    support::mock_guest_activation(&server);
    server.mock(|when, then| {
        when.method(POST)
            .path("/1.1/onboarding/task.json")
            .query_param("flow_name", "login");
        then.status(200).json_body(json!({
            "flow_token": "ft-1",
            "subtasks": [{"subtask_id": "LoginJsInstrumentationSubtask"}]
        }));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/1.1/onboarding/task.json")
            .body_contains("js_instrumentation");
        then.status(200)
            .header("set-cookie", "ct0=csrf-1; Path=/")
            .json_body(json!({
                "flow_token": "ft-2",
                "subtasks": [{"subtask_id": "LoginEnterUserIdentifierSSO"}]
            }));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/1.1/onboarding/task.json")
            .body_contains("user_identifier");
        then.status(200).json_body(json!({
            "flow_token": "ft-3",
            "subtasks": [{"subtask_id": "LoginEnterPassword"}]
        }));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/1.1/onboarding/task.json")
            .body_contains("enter_password");
        then.status(200)
            .header("set-cookie", "auth_token=sess-token-1; Path=/")
            .json_body(json!({
                "flow_token": "ft-4",
                "subtasks": [{"subtask_id": "LoginSuccessSubtask"}]
            }));
    });

    h.state.pool.ensure_initialized().await;

    assert_eq!(h.state.pool.active_len(), 1);
    let alice = h.state.store.get("alice").unwrap();
    assert_eq!(alice.token_state, TokenState::Working);
    assert!(!alice.failed_login);
    assert_eq!(alice.credential.auth_token.as_deref(), Some("sess-token-1"));
    assert!(alice.last_used.is_some());
}

#[tokio::test]
async fn deny_login_marks_account_failed() {
    let server = MockServer::start_async().await;
    let h = support::gateway(&server.base_url(), 1);
    h.state
        .store
        .add(vec![support::Harness::credential("mallory", None)])
        .unwrap();

    support::mock_guest_activation(&server);
    server.mock(|when, then| {
        when.method(POST)
            .path("/1.1/onboarding/task.json")
            .query_param("flow_name", "login");
        then.status(200).json_body(json!({
            "flow_token": "ft-1",
            "subtasks": [{"subtask_id": "DenyLoginSubtask"}]
        }));
    });

    h.state.pool.ensure_initialized().await;

    assert_eq!(h.state.pool.active_len(), 0);
    let mallory = h.state.store.get("mallory").unwrap();
    assert!(mallory.failed_login);
    assert_eq!(mallory.token_state, TokenState::Failed);
    assert!(mallory.last_failed_at.is_some());
}

#[tokio::test]
async fn unknown_subtask_aborts_the_flow() {
    let server = MockServer::start_async().await;
    let h = support::gateway(&server.base_url(), 1);
    h.state
        .store
        .add(vec![support::Harness::credential("carol", None)])
        .unwrap();

    support::mock_guest_activation(&server);
    server.mock(|when, then| {
        when.method(POST)
            .path("/1.1/onboarding/task.json")
            .query_param("flow_name", "login");
        then.status(200).json_body(json!({
            "flow_token": "ft-1",
            "subtasks": [{"subtask_id": "BrandNewChallenge"}]
        }));
    });

    h.state.pool.ensure_initialized().await;

    assert_eq!(h.state.pool.active_len(), 0);
    assert!(h.state.store.get("carol").unwrap().failed_login);
}

/// A pre-seeded session cookie that still works skips the interactive
/// flow entirely.
#[tokio::test]
async fn seeded_auth_token_short_circuits_login() {
    let server = MockServer::start_async().await;
    let h = support::gateway(&server.base_url(), 1);
    h.state
        .store
        .add(vec![support::Harness::credential("alice", Some("seeded-tok"))])
        .unwrap();

    support::mock_token_login(&server);
    // No onboarding mocks: touching the flow would 404 and fail the test
    // through an empty pool.
    h.state.pool.ensure_initialized().await;

    assert_eq!(h.state.pool.active_len(), 1);
    let alice = h.state.store.get("alice").unwrap();
    assert_eq!(alice.token_state, TokenState::Working);
    assert_eq!(alice.credential.auth_token.as_deref(), Some("seeded-tok"));
}

/// A rejected seeded cookie is cleared before the interactive fallback
/// runs; with no flow mocks the fallback fails and the account is parked.
#[tokio::test]
async fn rejected_seeded_token_is_cleared() {
    let server = MockServer::start_async().await;
    let h = support::gateway(&server.base_url(), 1);
    h.state
        .store
        .add(vec![support::Harness::credential("bob", Some("stale-tok"))])
        .unwrap();

    server.mock(|when, then| {
        when.method(GET).path("/home");
        then.status(200).body("<html></html>");
    });
    server.mock(|when, then| {
        when.method(GET).path_contains("/Viewer");
        then.status(401);
    });

    h.state.pool.ensure_initialized().await;

    assert_eq!(h.state.pool.active_len(), 0);
    let bob = h.state.store.get("bob").unwrap();
    assert_eq!(bob.credential.auth_token, None);
    assert!(bob.failed_login);
}
