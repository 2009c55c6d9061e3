use crate::error::{Result, RuleflowError};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Write access to the external tracking system.
///
/// `fields` are keyed by external (dotted) field name. A failed call is a
/// [`RuleflowError::Tracker`]; callers decide whether it is fatal.
#[async_trait]
pub trait WorkItemClient: Send + Sync {
    async fn add_comment(&self, work_item_id: i64, text: &str, project: &str) -> Result<()>;

    async fn update_fields(
        &self,
        work_item_id: i64,
        fields: &BTreeMap<String, String>,
        project: &str,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// RecordingClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientCall {
    Comment {
        work_item_id: i64,
        project: String,
        text: String,
    },
    Update {
        work_item_id: i64,
        project: String,
        fields: BTreeMap<String, String>,
    },
}

/// In-memory client that records successful calls. Used for dry runs and
/// tests; either call kind can be switched to fail.
#[derive(Debug, Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<ClientCall>>,
    fail_comments: AtomicBool,
    fail_updates: AtomicBool,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_comments(&self, fail: bool) {
        self.fail_comments.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn comments(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClientCall::Comment { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Every field update merged in call order.
    pub fn updated_fields(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for call in self.calls() {
            if let ClientCall::Update { fields, .. } = call {
                merged.extend(fields);
            }
        }
        merged
    }

    fn push(&self, call: ClientCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl WorkItemClient for RecordingClient {
    async fn add_comment(&self, work_item_id: i64, text: &str, project: &str) -> Result<()> {
        if self.fail_comments.load(Ordering::SeqCst) {
            return Err(RuleflowError::tracker("comment rejected"));
        }
        self.push(ClientCall::Comment {
            work_item_id,
            project: project.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn update_fields(
        &self,
        work_item_id: i64,
        fields: &BTreeMap<String, String>,
        project: &str,
    ) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(RuleflowError::tracker("update rejected"));
        }
        self.push(ClientCall::Update {
            work_item_id,
            project: project.to_string(),
            fields: fields.clone(),
        });
        Ok(())
    }
}
