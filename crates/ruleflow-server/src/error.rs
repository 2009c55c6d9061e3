use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ruleflow_core::RuleflowError;

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// 400 Bad Request with the given message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(RuleflowError::InvalidPayload(msg.into()).into())
    }
}

fn status_for(e: &RuleflowError) -> StatusCode {
    match e {
        RuleflowError::InvalidPayload(_)
        | RuleflowError::InvalidRule { .. }
        | RuleflowError::Expression { .. }
        | RuleflowError::Script { .. }
        | RuleflowError::MissingParameter { .. } => StatusCode::BAD_REQUEST,
        RuleflowError::NotFound(_) => StatusCode::NOT_FOUND,
        RuleflowError::Tracker(_) => StatusCode::BAD_GATEWAY,
        RuleflowError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        RuleflowError::Evaluation(_)
        | RuleflowError::DuplicateHandler(_)
        | RuleflowError::Config(_)
        | RuleflowError::Io(_)
        | RuleflowError::Yaml(_)
        | RuleflowError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .downcast_ref::<RuleflowError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(e: RuleflowError) -> StatusCode {
        AppError(e.into()).into_response().status()
    }

    #[test]
    fn invalid_payload_maps_to_400() {
        assert_eq!(
            status(RuleflowError::InvalidPayload("no resource".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn invalid_rule_maps_to_400() {
        assert_eq!(
            status(RuleflowError::InvalidRule {
                name: "r".into(),
                reason: "empty".into()
            }),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(
            status(RuleflowError::NotFound("no pending review".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn tracker_maps_to_502() {
        assert_eq!(status(RuleflowError::tracker("down")), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn store_maps_to_503() {
        assert_eq!(
            status(RuleflowError::Store("locked".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn io_maps_to_500() {
        assert_eq!(
            status(RuleflowError::Io(std::io::Error::other("disk full"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn foreign_error_maps_to_500() {
        let response = AppError(anyhow::anyhow!("unexpected")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn body_is_json() {
        let response = AppError::bad_request("nope").into_response();
        let ct = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .expect("should have content-type");
        assert!(ct.to_str().unwrap().contains("application/json"));
    }
}
