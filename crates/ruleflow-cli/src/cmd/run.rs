use crate::output::{print_json, print_table};
use anyhow::Context;
use ruleflow_core::client::{ClientCall, RecordingClient};
use ruleflow_core::config::Config;
use ruleflow_core::context::WorkItemEvent;
use ruleflow_core::guard::ExecutionGuard;
use ruleflow_core::orchestrator::{EventOutcome, RuleOrchestrator};
use ruleflow_core::session::ExecutionSession;
use ruleflow_core::store::YamlRuleStore;
use std::path::Path;
use std::sync::Arc;

/// Dry run: the stored rules see the event, but every tracker write lands in
/// a recording client and is printed instead of sent.
pub fn run(root: &Path, event_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(root).context("failed to load config")?;
    let data = std::fs::read_to_string(event_path)
        .with_context(|| format!("failed to read {}", event_path.display()))?;
    let event: WorkItemEvent = serde_json::from_str(&data).context("malformed event")?;

    let client = Arc::new(RecordingClient::new());
    let orchestrator = RuleOrchestrator::new(
        Arc::new(YamlRuleStore::new(config.rules_dir(root))),
        client.clone(),
        Arc::new(ExecutionGuard::new(config.guard.clone())),
    )?;

    let rt = tokio::runtime::Runtime::new()?;
    let session = match rt.block_on(orchestrator.process_event(&event))? {
        EventOutcome::Accepted(session) => session,
        EventOutcome::RateLimited { work_item_id } => {
            anyhow::bail!("event for work item {work_item_id} was rate limited")
        }
    };
    let calls = client.calls();

    if json {
        return print_json(&serde_json::json!({
            "summary": session.summary(),
            "results": session.results,
            "calls": calls,
        }));
    }

    print_session(&session);
    if !calls.is_empty() {
        println!();
        print_calls(&calls);
    }
    Ok(())
}

fn print_session(session: &ExecutionSession) {
    println!(
        "Work item {} ({}, {}): {} passed, {} failed, {} skipped in {}ms",
        session.work_item_id,
        session.work_item_type,
        session.project_name,
        session.passed(),
        session.failed(),
        session.skipped(),
        session.duration_ms,
    );
    if session.results.is_empty() {
        println!("No applicable rules.");
        return;
    }
    println!();

    let rows = session
        .results
        .iter()
        .map(|r| {
            vec![
                r.priority.to_string(),
                r.rule_name.clone(),
                format!("{:?}", r.status).to_uppercase(),
                r.actions.len().to_string(),
                r.error_message.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["PRIORITY", "RULE", "STATUS", "ACTIONS", "ERROR"], rows);
}

fn print_calls(calls: &[ClientCall]) {
    let rows = calls
        .iter()
        .map(|call| match call {
            ClientCall::Comment { text, .. } => vec!["comment".to_string(), text.clone()],
            ClientCall::Update { fields, .. } => vec![
                "update".to_string(),
                fields
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(", "),
            ],
        })
        .collect();
    print_table(&["CALL", "DETAIL"], rows);
}
