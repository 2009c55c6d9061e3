use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/guard: sizes of the guard's bookkeeping maps.
pub async fn get_guard(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let stats = app.guard.stats();
    Ok(Json(serde_json::json!({
        "timestamps": stats.timestamps,
        "hourlyCounters": stats.hourly_counters,
        "fieldHashes": stats.field_hashes,
        "lastSweep": stats.last_sweep,
        "throttledWorkItems": app.throttle.len(),
        "config": app.guard.config(),
    })))
}

/// POST /api/guard/sweep: run a sweep now and report what was removed.
pub async fn sweep(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let removed = app.guard.sweep();
    Ok(Json(serde_json::json!({
        "removed": removed,
        "total": removed.total(),
    })))
}
