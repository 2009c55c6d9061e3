use axum::http::StatusCode;
use http_body_util::BodyExt;
use ruleflow_core::client::RecordingClient;
use ruleflow_core::config::Config;
use ruleflow_server::state::AppState;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn app(dir: &TempDir) -> (Arc<RecordingClient>, axum::Router) {
    let client = Arc::new(RecordingClient::new());
    let state = AppState::new(dir.path().to_path_buf(), Config::default(), client.clone()).unwrap();
    (client, ruleflow_server::build_router(state))
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a POST request with a JSON body via `oneshot` and return (status, parsed JSON body).
async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn task_rule() -> serde_json::Value {
    serde_json::json!([{
        "name": "pick-up",
        "expression": "body.Fields.System_State == \"Active\"",
        "applies_to": "Task",
        "rule_set": "Apollo",
        "priority": 10,
        "actions": [{
            "action_name": "SetField",
            "parameters": [
                {"key": "FieldName", "value": "System.Reason"},
                {"key": "FieldValue", "value": "Picked up"}
            ]
        }]
    }])
}

fn event(work_item_id: i64) -> serde_json::Value {
    serde_json::json!({
        "eventType": "workitem.updated",
        "resource": {
            "workItemId": work_item_id,
            "revision": {
                "fields": {
                    "System.TeamProject": "Apollo",
                    "System.WorkItemType": "Task",
                    "System.State": "Active",
                    "System.Title": "Write docs"
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upsert_then_list_rules() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);

    let (status, body) = post_json(router.clone(), "/api/rules", task_rule()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inserted"], 1);

    let (status, body) = get(router, "/api/rules/Apollo").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "pick-up");
    assert!(dir.path().join("rules/Apollo.yaml").exists());
}

#[tokio::test]
async fn empty_rule_list_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);
    let (status, body) = post_json(router, "/api/rules", serde_json::json!([])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("empty"));
}

#[tokio::test]
async fn invalid_rule_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);
    let (status, _) = post_json(
        router,
        "/api/rules",
        serde_json::json!([{"name": "", "expression": "true"}]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Execute
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execute_runs_rules_and_writes_fields() {
    let dir = TempDir::new().unwrap();
    let (client, router) = app(&dir);
    post_json(router.clone(), "/api/rules", task_rule()).await;

    let (status, body) = post_json(router, "/api/rules/execute", event(42)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workItemId"], 42);
    assert_eq!(body["summary"]["passed"], 1);
    assert_eq!(body["results"][0]["status"], "PASSED");
    assert_eq!(body["results"][0]["fieldChanges"][0]["newValue"], "Picked up");
    assert_eq!(
        client.updated_fields().get("System.Reason").map(String::as_str),
        Some("Picked up")
    );
}

#[tokio::test]
async fn repeat_event_is_rate_limited() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);

    let (status, _) = post_json(router.clone(), "/api/rules/execute", event(7)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = post_json(router, "/api/rules/execute", event(7)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Request rate limited");
    assert_eq!(body["workItemId"], 7);
}

#[tokio::test]
async fn payload_without_fields_is_400() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);
    let (status, body) = post_json(
        router,
        "/api/rules/execute",
        serde_json::json!({"eventType": "workitem.updated", "resource": {"workItemId": 3}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid payload"));
}

// ---------------------------------------------------------------------------
// Convert / import
// ---------------------------------------------------------------------------

#[tokio::test]
async fn convert_returns_rules_and_notes() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);
    let (status, body) = post_json(
        router,
        "/api/rules/convert",
        serde_json::json!({
            "xmlContent": "<rule name=\"Flag\">if (x) { self[\"F\"] = \"v\"; }</rule>",
            "ruleSet": "Apollo"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rules"][0]["name"], "Flag");
    assert_eq!(body["rules"][0]["rule_set"], "Apollo");
    assert_eq!(body["notes"][0]["classification"], "boolean-expression");
    assert!(body["saved"].is_null());
}

#[tokio::test]
async fn import_stores_script_rules() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);
    let (status, body) = post_json(
        router.clone(),
        "/api/rules/import",
        serde_json::json!({
            "source": "<rule name=\"S\">self[\"A\"] = \"b\";</rule>",
            "ruleSet": "Apollo",
            "priority": 5
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inserted"], 1);

    let (_, rules) = get(router, "/api/rules/Apollo").await;
    assert_eq!(rules[0]["priority"], 5);
    assert!(rules[0]["expression"].as_str().unwrap().starts_with("ScriptRule("));
}

// ---------------------------------------------------------------------------
// Manual review
// ---------------------------------------------------------------------------

async fn seed_placeholder(router: axum::Router) {
    let (status, body) = post_json(
        router,
        "/api/rules/convert",
        serde_json::json!({
            "xmlContent": "<rule name=\"Links\" appliesTo=\"Bug\">foreach (var l in links) { self[\"A\"] = \"b\"; }</rule>",
            "ruleSet": "Apollo",
            "save": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["notes"][0]["classification"], "manual-review");
}

#[tokio::test]
async fn manual_review_list_and_complete() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);
    seed_placeholder(router.clone()).await;

    let (status, body) = get(router.clone(), "/api/rules/Apollo/manual-review").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["ruleName"], "Links_ManualReview");
    assert_eq!(body[0]["complexityReasons"][0], "loop");

    let (status, body) = post_json(
        router.clone(),
        "/api/rules/Apollo/manual-review/Links_ManualReview/complete",
        serde_json::json!({
            "reviewedExpression": "body.Fields.System_State == \"Active\"",
            "activateImmediately": true,
            "reviewerName": "dana",
            "reviewedActions": [{
                "action_name": "SetField",
                "parameters": [
                    {"key": "FieldName", "value": "System.Reason"},
                    {"key": "FieldValue", "value": "Reviewed"}
                ]
            }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Links");
    assert_eq!(body["is_active"], true);

    let (_, pending) = get(router.clone(), "/api/rules/Apollo/manual-review").await;
    assert_eq!(pending, serde_json::json!([]));
    let (_, active) = get(router, "/api/rules/Apollo").await;
    assert_eq!(active[0]["name"], "Links");
}

#[tokio::test]
async fn manual_review_completion_needs_a_compiling_expression() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);
    seed_placeholder(router.clone()).await;

    let (status, body) = post_json(
        router,
        "/api/rules/Apollo/manual-review/Links_ManualReview/complete",
        serde_json::json!({
            "reviewedExpression": "body.Fields.System_State ==",
            "reviewedActions": [{"action_name": "AddComment"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("does not compile"));
}

#[tokio::test]
async fn manual_review_reject_and_unknown_name() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);
    seed_placeholder(router.clone()).await;

    let (status, body) = post_json(
        router.clone(),
        "/api/rules/Apollo/manual-review/Links_ManualReview/reject",
        serde_json::json!({"rejectionReason": "obsolete", "reviewerName": "dana"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "deactivated");
    assert_eq!(body["ruleName"], "Links_Rejected");

    let (status, _) = post_json(
        router,
        "/api/rules/Apollo/manual-review/Links_ManualReview/reject",
        serde_json::json!({"deleteRule": true}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn validate_expression_reports_errors_and_fields() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);

    let (status, body) = post_json(
        router.clone(),
        "/api/rules/validate-expression",
        serde_json::json!({"expression": "body.Fields.System_State == \"Active\" && self[\"Custom.Risk\"] != null"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isValid"], true);
    assert_eq!(
        body["referencedFields"],
        serde_json::json!(["Custom_Risk", "System_State"])
    );

    let (status, body) = post_json(
        router,
        "/api/rules/validate-expression",
        serde_json::json!({"expression": "body.Fields.System_State =="}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isValid"], false);
    assert!(body["error"].is_string());
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn guard_reports_entries_after_execution() {
    let dir = TempDir::new().unwrap();
    let (_, router) = app(&dir);
    post_json(router.clone(), "/api/rules", task_rule()).await;
    post_json(router.clone(), "/api/rules/execute", event(9)).await;

    let (status, body) = get(router.clone(), "/api/guard").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["timestamps"], 1);
    assert_eq!(body["throttledWorkItems"], 1);

    let (status, body) = post_json(router, "/api/guard/sweep", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
}
