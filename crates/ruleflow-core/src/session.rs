use crate::context::WorkItemContext;
use crate::rule::{ConditionType, RuleDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Set,
    Append,
    Prepend,
    Calculate,
    State,
    Script,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: String,
    pub old_value: String,
    pub new_value: String,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub action_name: String,
    pub condition_type: ConditionType,
    pub execution_order: i32,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleExecutionResult {
    pub rule_name: String,
    pub rule_set: String,
    pub applies_to: String,
    pub priority: i32,
    pub expression: String,
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
    #[serde(default)]
    pub field_changes: Vec<FieldChange>,
    pub duration_ms: u64,
}

impl RuleExecutionResult {
    pub fn new(rule: &RuleDefinition, status: RuleStatus) -> Self {
        Self {
            rule_name: rule.name.clone(),
            rule_set: rule.rule_set.clone(),
            applies_to: rule.applies_to.clone(),
            priority: rule.priority,
            expression: rule.expression.clone(),
            status,
            error_message: None,
            actions: Vec::new(),
            field_changes: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionSession
// ---------------------------------------------------------------------------

/// The record of one event's processing: every considered rule, in the
/// order it was handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSession {
    pub session_id: Uuid,
    pub work_item_id: i64,
    pub work_item_type: String,
    pub project_name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub total_rules: usize,
    pub results: Vec<RuleExecutionResult>,
}

impl ExecutionSession {
    pub fn start(ctx: &WorkItemContext) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            work_item_id: ctx.id,
            work_item_type: ctx.work_item_type(),
            project_name: ctx.project(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: 0,
            total_rules: 0,
            results: Vec::new(),
        }
    }

    pub fn push(&mut self, result: RuleExecutionResult) {
        self.results.push(result);
    }

    pub fn finish(&mut self) {
        let end = Utc::now();
        self.duration_ms = (end - self.start_time).num_milliseconds().max(0) as u64;
        self.end_time = Some(end);
        self.total_rules = self.results.len();
    }

    fn count(&self, status: RuleStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn passed(&self) -> usize {
        self.count(RuleStatus::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(RuleStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(RuleStatus::Skipped)
    }

    /// Share of recorded rules that passed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.passed() as f64 * 100.0 / self.results.len() as f64
    }

    pub fn result(&self, rule_name: &str) -> Option<&RuleExecutionResult> {
        self.results.iter().find(|r| r.rule_name == rule_name)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            work_item_id: self.work_item_id,
            total_rules: self.results.len(),
            passed: self.passed(),
            failed: self.failed(),
            skipped: self.skipped(),
            duration_ms: self.duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub work_item_id: i64,
    pub total_rules: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receives every finished session. Sinks must not fail the execution.
pub trait SessionSink: Send + Sync {
    fn record(&self, session: &ExecutionSession);
}

/// Logs a one-line summary plus every failed rule.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSessionSink;

impl SessionSink for TracingSessionSink {
    fn record(&self, session: &ExecutionSession) {
        info!(
            session = %session.session_id,
            work_item = session.work_item_id,
            project = %session.project_name,
            total = session.results.len(),
            passed = session.passed(),
            failed = session.failed(),
            skipped = session.skipped(),
            duration_ms = session.duration_ms,
            "rule execution summary ({:.1}% passed)",
            session.success_rate()
        );
        for r in session
            .results
            .iter()
            .filter(|r| r.status == RuleStatus::Failed)
        {
            warn!(
                work_item = session.work_item_id,
                rule = %r.rule_name,
                "rule failed: {}",
                r.error_message.as_deref().unwrap_or("condition not met")
            );
        }
    }
}

/// Appends each session as one JSON line to a per-day file
/// `rule-executions-YYYY-MM-DD.jsonl` under `dir`.
#[derive(Debug)]
pub struct JsonlSessionSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSessionSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, day: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("rule-executions-{}.jsonl", day.format("%Y-%m-%d")))
    }
}

impl SessionSink for JsonlSessionSink {
    fn record(&self, session: &ExecutionSession) {
        let line = match serde_json::to_string(session) {
            Ok(l) => l,
            Err(e) => {
                warn!("failed to serialize session {}: {e}", session.session_id);
                return;
            }
        };
        let path = self.path_for(session.start_time);
        let _guard = self.write_lock.lock();
        if let Err(e) = crate::io::append_line(&path, &line) {
            warn!("failed to append session to {}: {e}", path.display());
        }
    }
}

/// Forwards to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink(pub Vec<Arc<dyn SessionSink>>);

impl SessionSink for FanoutSink {
    fn record(&self, session: &ExecutionSession) {
        for sink in &self.0 {
            sink.record(session);
        }
    }
}

/// Keeps sessions in memory; useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySessionSink {
    sessions: Mutex<Vec<ExecutionSession>>,
}

impl MemorySessionSink {
    pub fn sessions(&self) -> Vec<ExecutionSession> {
        self.sessions.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl SessionSink for MemorySessionSink {
    fn record(&self, session: &ExecutionSession) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push(session.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session() -> ExecutionSession {
        let ctx = WorkItemContext::new(5)
            .with_field("System.TeamProject", "Apollo")
            .with_field("System.WorkItemType", "Bug");
        let mut s = ExecutionSession::start(&ctx);
        s.push(RuleExecutionResult::new(
            &RuleDefinition::new("a", "true"),
            RuleStatus::Passed,
        ));
        s.push(
            RuleExecutionResult::new(&RuleDefinition::new("b", "x"), RuleStatus::Failed)
                .with_error("boom"),
        );
        s.push(RuleExecutionResult::new(
            &RuleDefinition::new("c", "true"),
            RuleStatus::Skipped,
        ));
        s.finish();
        s
    }

    #[test]
    fn counts_and_rate() {
        let s = session();
        assert_eq!((s.passed(), s.failed(), s.skipped()), (1, 1, 1));
        assert_eq!(s.total_rules, 3);
        assert!((s.success_rate() - 33.333).abs() < 0.01);
        assert!(s.end_time.is_some());
        assert_eq!(s.project_name, "Apollo");
    }

    #[test]
    fn serializes_camel_case_with_upper_status() {
        let json = serde_json::to_value(session()).unwrap();
        assert_eq!(json["workItemId"], 5);
        assert_eq!(json["results"][0]["status"], "PASSED");
        assert_eq!(json["results"][1]["errorMessage"], "boom");
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_session() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlSessionSink::new(dir.path());
        let s = session();
        sink.record(&s);
        sink.record(&s);
        let content = std::fs::read_to_string(sink.path_for(s.start_time)).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: ExecutionSession = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.session_id, s.session_id);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemorySessionSink::default());
        let b = Arc::new(MemorySessionSink::default());
        let fan = FanoutSink(vec![a.clone(), b.clone()]);
        fan.record(&session());
        assert_eq!(a.sessions().len(), 1);
        assert_eq!(b.sessions().len(), 1);
    }
}
