use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ruleflow_core::client::WorkItemClient;
use ruleflow_core::config::TrackerConfig;
use ruleflow_core::{Result, RuleflowError};
use serde::Serialize;
use reqwest::Url;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Serialize)]
struct PatchOp<'a> {
    op: &'static str,
    path: String,
    value: &'a str,
}

/// Tracker REST client: JSON-patch field updates and comment creation,
/// authenticated with a personal access token over Basic auth.
#[derive(Debug, Clone)]
pub struct HttpWorkItemClient {
    http: reqwest::Client,
    /// `None` until configured; every write then fails.
    organization_url: Option<Url>,
    api_version: String,
    auth: Option<String>,
}

impl HttpWorkItemClient {
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        Self::with_token(config, config.token())
    }

    pub fn with_token(config: &TrackerConfig, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| RuleflowError::tracker(format!("building http client: {e}")))?;
        let organization_url = match config.organization_url.trim() {
            "" => None,
            raw => Some(parse_organization_url(raw)?),
        };
        Ok(Self {
            http,
            organization_url,
            api_version: config.api_version.clone(),
            auth: token.map(|t| format!("Basic {}", BASE64.encode(format!(":{t}")))),
        })
    }

    /// `{org}/{project}/_apis/wit/workitems/{id}[/{tail}]?api-version=..`,
    /// with every segment percent-encoded.
    fn work_item_url(&self, project: &str, work_item_id: i64, tail: Option<&str>) -> Result<Url> {
        let mut url = self
            .organization_url
            .clone()
            .ok_or_else(|| RuleflowError::tracker("tracker.organization_url is not set"))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| RuleflowError::tracker("organization url cannot carry a path"))?;
            segments
                .pop_if_empty()
                .push(project)
                .extend(["_apis", "wit", "workitems"])
                .push(&work_item_id.to_string());
            if let Some(tail) = tail {
                segments.push(tail);
            }
        }
        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(value) => req.header(reqwest::header::AUTHORIZATION, value),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str, work_item_id: i64) -> Result<()> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| RuleflowError::tracker(format!("{what} for work item {work_item_id}: {e}")))?;
        let status = response.status();
        if status.is_success() {
            debug!(work_item = work_item_id, "{what} accepted ({status})");
            return Ok(());
        }
        let details = response.text().await.unwrap_or_default();
        error!(work_item = work_item_id, %status, "{what} rejected: {details}");
        Err(RuleflowError::tracker(format!(
            "{what} for work item {work_item_id} failed with status {status}"
        )))
    }
}

fn parse_organization_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)
        .map_err(|e| RuleflowError::tracker(format!("invalid organization url '{raw}': {e}")))?;
    if url.cannot_be_a_base() {
        return Err(RuleflowError::tracker(format!(
            "organization url '{raw}' cannot carry a path"
        )));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[async_trait]
impl WorkItemClient for HttpWorkItemClient {
    async fn add_comment(&self, work_item_id: i64, text: &str, project: &str) -> Result<()> {
        let url = self.work_item_url(project, work_item_id, Some("comments"))?;
        let req = self
            .http
            .post(url)
            .json(&serde_json::json!({ "text": text }));
        self.send(req, "add comment", work_item_id).await
    }

    async fn update_fields(
        &self,
        work_item_id: i64,
        fields: &BTreeMap<String, String>,
        project: &str,
    ) -> Result<()> {
        let patch: Vec<PatchOp<'_>> = fields
            .iter()
            .map(|(field, value)| PatchOp {
                op: "replace",
                path: format!("/fields/{field}"),
                value,
            })
            .collect();
        let body = serde_json::to_vec(&patch)?;
        let url = self.work_item_url(project, work_item_id, None)?;
        let req = self
            .http
            .patch(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json-patch+json")
            .body(body);
        self.send(req, "update fields", work_item_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(url: &str) -> HttpWorkItemClient {
        let config = TrackerConfig {
            organization_url: format!("{url}/acme/"),
            ..TrackerConfig::default()
        };
        HttpWorkItemClient::with_token(&config, Some("secret".into())).unwrap()
    }

    #[tokio::test]
    async fn update_sends_json_patch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/acme/Apollo/_apis/wit/workitems/42")
            .match_query(Matcher::UrlEncoded("api-version".into(), "7.1-preview.3".into()))
            .match_header("content-type", "application/json-patch+json")
            .match_header("authorization", "Basic OnNlY3JldA==")
            .match_body(Matcher::Json(serde_json::json!([
                {"op": "replace", "path": "/fields/System.State", "value": "Active"}
            ])))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let fields = BTreeMap::from([("System.State".to_string(), "Active".to_string())]);
        client(&server.url())
            .update_fields(42, &fields, "Apollo")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn comment_posts_text() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/acme/Apollo/_apis/wit/workitems/7/comments")
            .match_query(Matcher::Any)
            .match_body(Matcher::Json(serde_json::json!({"text": "hello"})))
            .with_status(200)
            .create_async()
            .await;

        client(&server.url())
            .add_comment(7, "hello", "Apollo")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn url_segments_are_encoded() {
        let c = client("http://tracker.local");
        let url = c.work_item_url("Team #1/Ops", 42, Some("comments")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://tracker.local/acme/Team%20%231%2FOps/_apis/wit/workitems/42/comments?api-version=7.1-preview.3"
        );
    }

    #[test]
    fn unusable_organization_url_is_rejected() {
        for bad in ["not a url", "mailto:ops@example.com"] {
            let config = TrackerConfig {
                organization_url: bad.into(),
                ..TrackerConfig::default()
            };
            let err = HttpWorkItemClient::with_token(&config, None).unwrap_err();
            assert!(matches!(err, RuleflowError::Tracker(_)));
        }
    }

    #[test]
    fn unset_organization_url_fails_on_use() {
        let c = HttpWorkItemClient::with_token(&TrackerConfig::default(), None).unwrap();
        assert!(matches!(
            c.work_item_url("Apollo", 1, None),
            Err(RuleflowError::Tracker(_))
        ));
    }

    #[tokio::test]
    async fn project_with_reserved_characters_stays_in_its_segment() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/acme/Team%20%231/_apis/wit/workitems/5")
            .match_query(Matcher::UrlEncoded("api-version".into(), "7.1-preview.3".into()))
            .with_status(200)
            .create_async()
            .await;

        let fields = BTreeMap::from([("System.State".to_string(), "Active".to_string())]);
        client(&server.url())
            .update_fields(5, &fields, "Team #1")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_tracker_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PATCH", Matcher::Any)
            .with_status(400)
            .with_body("bad field")
            .create_async()
            .await;

        let fields = BTreeMap::from([("X".to_string(), "1".to_string())]);
        let err = client(&server.url())
            .update_fields(1, &fields, "Apollo")
            .await
            .unwrap_err();
        assert!(matches!(err, RuleflowError::Tracker(_)));
    }
}
