use axum::extract::{Path, State};
use axum::Json;
use ruleflow_core::review::{
    complete_review, pending_reviews, reject_review, PendingReview, RejectOutcome,
    ReviewCompletion, ReviewRejection,
};
use ruleflow_core::rule::RuleDefinition;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/rules/{rule_set}/manual-review: placeholders awaiting a reviewer.
pub async fn list_pending(
    State(app): State<AppState>,
    Path(rule_set): Path<String>,
) -> Result<Json<Vec<PendingReview>>, AppError> {
    Ok(Json(pending_reviews(app.store.as_ref(), &rule_set).await?))
}

/// POST /api/rules/{rule_set}/manual-review/{name}/complete
pub async fn complete(
    State(app): State<AppState>,
    Path((rule_set, name)): Path<(String, String)>,
    Json(body): Json<ReviewCompletion>,
) -> Result<Json<RuleDefinition>, AppError> {
    let rule = complete_review(
        app.store.as_ref(),
        app.orchestrator.engine().as_ref(),
        &rule_set,
        &name,
        body,
    )
    .await?;
    Ok(Json(rule))
}

/// POST /api/rules/{rule_set}/manual-review/{name}/reject
pub async fn reject(
    State(app): State<AppState>,
    Path((rule_set, name)): Path<(String, String)>,
    Json(body): Json<ReviewRejection>,
) -> Result<Json<RejectOutcome>, AppError> {
    Ok(Json(reject_review(app.store.as_ref(), &rule_set, &name, body).await?))
}
