use axum::extract::{Path, State};
use axum::Json;
use ruleflow_core::context::WorkItemEvent;
use ruleflow_core::converter::{import_script_rules, ConvertOptions, RuleConverter};
use ruleflow_core::engine::{check_expression, ExpressionCheck};
use ruleflow_core::orchestrator::EventOutcome;
use ruleflow_core::rule::{RuleDefinition, DEFAULT_PRIORITY};
use serde::Deserialize;
use tracing::info;

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/rules/execute: webhook entry point for tracker events.
pub async fn execute(
    State(app): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let event: WorkItemEvent = serde_json::from_value(body)
        .map_err(|e| AppError::bad_request(format!("malformed event: {e}")))?;

    let result = match app.orchestrator.process_event(&event).await? {
        EventOutcome::RateLimited { work_item_id } => serde_json::json!({
            "message": "Request rate limited",
            "workItemId": work_item_id,
        }),
        EventOutcome::Accepted(session) => serde_json::json!({
            "message": "Rules executed",
            "workItemId": session.work_item_id,
            "summary": session.summary(),
            "results": session.results,
        }),
    };
    Ok(Json(result))
}

/// GET /api/rules/{rule_set}: active rules in evaluation order.
pub async fn list_rules(
    State(app): State<AppState>,
    Path(rule_set): Path<String>,
) -> Result<Json<Vec<RuleDefinition>>, AppError> {
    let rules = app.store.active_rules(&rule_set).await?;
    Ok(Json(rules))
}

/// POST /api/rules: insert or replace rules by name within their rule set.
pub async fn upsert_rules(
    State(app): State<AppState>,
    Json(rules): Json<Vec<RuleDefinition>>,
) -> Result<Json<serde_json::Value>, AppError> {
    if rules.is_empty() {
        return Err(AppError::bad_request("empty rule list"));
    }
    let summary = app.store.upsert(rules).await?;
    info!(inserted = summary.inserted, updated = summary.updated, "rules saved");
    Ok(Json(serde_json::json!(summary)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertBody {
    #[serde(alias = "xmlContent")]
    source: String,
    #[serde(flatten)]
    options: ConvertOptions,
    /// Persist the converted rules as well as returning them.
    #[serde(default)]
    save: bool,
}

/// POST /api/rules/convert: run the legacy rule converter.
pub async fn convert(
    State(app): State<AppState>,
    Json(body): Json<ConvertBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.source.trim().is_empty() {
        return Err(AppError::bad_request("source is required"));
    }
    let report = RuleConverter::convert(&body.source, &body.options);
    let saved = if body.save && !report.rules.is_empty() {
        Some(app.store.upsert(report.rules.clone()).await?)
    } else {
        None
    };
    Ok(Json(serde_json::json!({
        "rules": report.rules,
        "notes": report.notes,
        "saved": saved,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBody {
    #[serde(alias = "xmlContent")]
    source: String,
    rule_set: String,
    #[serde(default)]
    priority: Option<i32>,
}

/// POST /api/rules/import: store legacy blocks unchanged as script rules.
pub async fn import(
    State(app): State<AppState>,
    Json(body): Json<ImportBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.source.trim().is_empty() || body.rule_set.trim().is_empty() {
        return Err(AppError::bad_request("source and ruleSet are required"));
    }
    let report = import_script_rules(&body.source, body.rule_set.trim(), body.priority)?;
    let summary = if report.rules.is_empty() {
        Default::default()
    } else {
        app.store.upsert(report.rules.clone()).await?
    };
    info!(
        rule_set = %body.rule_set,
        priority = body.priority.unwrap_or(DEFAULT_PRIORITY),
        inserted = summary.inserted,
        updated = summary.updated,
        rejected = report.rejected.len(),
        "script rules imported"
    );
    Ok(Json(serde_json::json!({
        "inserted": summary.inserted,
        "updated": summary.updated,
        "rules": report.rules.iter().map(|r| &r.name).collect::<Vec<_>>(),
        "rejected": report.rejected,
    })))
}

#[derive(Deserialize)]
pub struct ValidateExpressionBody {
    expression: String,
}

/// POST /api/rules/validate-expression: compile an expression without
/// running it.
pub async fn validate_expression(
    State(app): State<AppState>,
    Json(body): Json<ValidateExpressionBody>,
) -> Json<ExpressionCheck> {
    Json(check_expression(
        app.orchestrator.engine().as_ref(),
        &body.expression,
    ))
}
