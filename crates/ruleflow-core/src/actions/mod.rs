//! Action handlers and the dispatcher that routes rule actions to them.

use crate::client::WorkItemClient;
use crate::context::WorkItemContext;
use crate::error::{Result, RuleflowError};
use crate::rule::RuleActionSpec;
use crate::script::ScriptExecutor;
use crate::session::{ActionRecord, ActionStatus, ChangeType, FieldChange};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};

pub mod add_comment;
pub mod change_state;
pub mod risk;
pub mod script_action;
pub mod set_field;
pub mod transition;
pub mod update_field;

// ---------------------------------------------------------------------------
// ActionHandler
// ---------------------------------------------------------------------------

/// What a handler did. `skipped` carries the reason when the handler
/// decided not to act (missing parameter, nothing to compute).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionEffect {
    pub field_changes: Vec<FieldChange>,
    pub skipped: Option<String>,
}

impl ActionEffect {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn changed(field_changes: Vec<FieldChange>) -> Self {
        Self {
            field_changes,
            skipped: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            field_changes: Vec::new(),
            skipped: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Registry key, matched case-insensitively against `action_name`.
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut WorkItemContext, action: &RuleActionSpec)
        -> Result<ActionEffect>;
}

/// Required parameter or a logged skip.
pub(crate) fn require<'a>(
    action: &'a RuleActionSpec,
    key: &str,
    work_item: i64,
) -> std::result::Result<&'a str, ActionEffect> {
    match action.get_non_blank(key) {
        Some(v) => Ok(v),
        None => {
            warn!(
                work_item,
                action = %action.action_name,
                "missing required parameter '{key}', skipping"
            );
            Err(ActionEffect::skipped(format!("missing parameter '{key}'")))
        }
    }
}

/// Push field writes as one update and, once accepted, apply them to the
/// context. Returns the change records with the pre-write values.
pub(crate) async fn write_fields(
    client: &dyn WorkItemClient,
    ctx: &mut WorkItemContext,
    writes: Vec<(String, String)>,
    change_type: ChangeType,
) -> Result<Vec<FieldChange>> {
    if writes.is_empty() {
        return Ok(Vec::new());
    }
    let batch: BTreeMap<String, String> = writes.iter().cloned().collect();
    client.update_fields(ctx.id, &batch, &ctx.project()).await?;

    let changes = writes
        .into_iter()
        .map(|(field, new_value)| {
            let old_value = ctx.field_str(&field);
            ctx.set(&field, new_value.clone());
            FieldChange {
                field,
                old_value,
                new_value,
                change_type,
            }
        })
        .collect();
    Ok(changes)
}

// ---------------------------------------------------------------------------
// ActionDispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub records: Vec<ActionRecord>,
    pub field_changes: Vec<FieldChange>,
}

/// Registry of action handlers keyed by lower-cased name. Duplicate names
/// are rejected when the registry is built.
pub struct ActionDispatcher {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionDispatcher {
    pub fn new(handlers: Vec<Arc<dyn ActionHandler>>) -> Result<Self> {
        let mut map = HashMap::with_capacity(handlers.len());
        for handler in handlers {
            let key = handler.name().to_ascii_lowercase();
            if map.insert(key, handler.clone()).is_some() {
                return Err(RuleflowError::DuplicateHandler(handler.name().to_string()));
            }
        }
        Ok(Self { handlers: map })
    }

    /// Registry with every built-in handler.
    pub fn with_builtins(
        client: Arc<dyn WorkItemClient>,
        scripts: Arc<ScriptExecutor>,
    ) -> Result<Self> {
        Self::new(builtin_handlers(client, scripts))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.values().map(|h| h.name()).collect();
        names.sort_unstable();
        names
    }

    /// Run `actions` in ascending execution order. One action's failure is
    /// recorded and never stops its siblings.
    pub async fn execute(
        &self,
        actions: &[&RuleActionSpec],
        ctx: &mut WorkItemContext,
    ) -> DispatchReport {
        let mut ordered = actions.to_vec();
        ordered.sort_by_key(|a| a.execution_order);

        let mut report = DispatchReport::default();
        for action in ordered {
            let mut record = ActionRecord {
                action_name: action.action_name.clone(),
                condition_type: action.condition_type,
                execution_order: action.execution_order,
                status: ActionStatus::Success,
                error_message: None,
            };

            let Some(handler) = self.handlers.get(&action.action_name.to_ascii_lowercase()) else {
                warn!(
                    work_item = ctx.id,
                    action = %action.action_name,
                    "no handler registered, skipping"
                );
                record.status = ActionStatus::Skipped;
                record.error_message = Some("unknown action".to_string());
                report.records.push(record);
                continue;
            };

            match handler.execute(ctx, action).await {
                Ok(effect) => {
                    if let Some(reason) = effect.skipped {
                        record.status = ActionStatus::Skipped;
                        record.error_message = Some(reason);
                    } else {
                        info!(
                            work_item = ctx.id,
                            action = %action.action_name,
                            changes = effect.field_changes.len(),
                            "action executed"
                        );
                    }
                    report.field_changes.extend(effect.field_changes);
                }
                Err(e) => {
                    error!(
                        work_item = ctx.id,
                        action = %action.action_name,
                        "action failed: {e}"
                    );
                    record.status = ActionStatus::Failed;
                    record.error_message = Some(e.to_string());
                }
            }
            report.records.push(record);
        }
        report
    }
}

pub fn builtin_handlers(
    client: Arc<dyn WorkItemClient>,
    scripts: Arc<ScriptExecutor>,
) -> Vec<Arc<dyn ActionHandler>> {
    vec![
        Arc::new(add_comment::AddCommentAction::new(client.clone())),
        Arc::new(set_field::SetFieldAction::new(client.clone())),
        Arc::new(update_field::UpdateFieldAction::new(client.clone())),
        Arc::new(change_state::ChangeStateAction::new(client.clone())),
        Arc::new(transition::TransitionToStateAction::new(client.clone())),
        Arc::new(risk::RiskCalculationAction::new(client)),
        Arc::new(script_action::ScriptAction::new(scripts)),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
