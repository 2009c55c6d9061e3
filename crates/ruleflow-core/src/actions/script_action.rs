use super::{require, ActionEffect, ActionHandler};
use crate::context::WorkItemContext;
use crate::error::{Result, RuleflowError};
use crate::rule::{RuleActionSpec, SCRIPT_ACTION, SCRIPT_NAME_PARAM, SCRIPT_SOURCE_PARAM};
use crate::script::ScriptExecutor;
use crate::session::{ChangeType, FieldChange};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs the snippet carried in the action's parameters through the
/// script executor. A failed script is an action error.
pub struct ScriptAction {
    scripts: Arc<ScriptExecutor>,
}

impl ScriptAction {
    pub fn new(scripts: Arc<ScriptExecutor>) -> Self {
        Self { scripts }
    }
}

#[async_trait]
impl ActionHandler for ScriptAction {
    fn name(&self) -> &'static str {
        SCRIPT_ACTION
    }

    async fn execute(
        &self,
        ctx: &mut WorkItemContext,
        action: &RuleActionSpec,
    ) -> Result<ActionEffect> {
        let source = match require(action, SCRIPT_SOURCE_PARAM, ctx.id) {
            Ok(s) => s,
            Err(skip) => return Ok(skip),
        };
        let name = action
            .get_non_blank(SCRIPT_NAME_PARAM)
            .unwrap_or("script")
            .trim();

        let before = ctx.clone();
        let outcome = self.scripts.run(name, source, ctx).await;
        if !outcome.success {
            return Err(RuleflowError::Script {
                name: name.to_string(),
                message: outcome.error.unwrap_or_else(|| "script failed".into()),
            });
        }

        let changes = outcome
            .changes
            .into_iter()
            .map(|(field, new_value)| FieldChange {
                old_value: before.field_str(&field),
                field,
                new_value,
                change_type: ChangeType::Script,
            })
            .collect();
        Ok(ActionEffect::changed(changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::tests::ctx;
    use crate::client::RecordingClient;

    fn handler() -> (Arc<RecordingClient>, ScriptAction) {
        let client = Arc::new(RecordingClient::new());
        let scripts = Arc::new(ScriptExecutor::new(client.clone()));
        (client, ScriptAction::new(scripts))
    }

    #[tokio::test]
    async fn delegates_to_executor() {
        let (client, handler) = handler();
        let action = RuleActionSpec::new(SCRIPT_ACTION)
            .param(SCRIPT_NAME_PARAM, "flag")
            .param(SCRIPT_SOURCE_PARAM, "if (self[\"System.State\"] == \"New\") { self[\"Custom.Flag\"] = \"yes\"; }");
        let effect = handler.execute(&mut ctx(), &action).await.unwrap();
        assert_eq!(client.updated_fields()["Custom.Flag"], "yes");
        assert_eq!(effect.field_changes[0].old_value, "");
        assert_eq!(effect.field_changes[0].change_type, ChangeType::Script);
    }

    #[tokio::test]
    async fn failing_script_is_an_error() {
        let (_, handler) = handler();
        let action = RuleActionSpec::new(SCRIPT_ACTION).param(SCRIPT_SOURCE_PARAM, "nonsense(");
        assert!(handler.execute(&mut ctx(), &action).await.is_err());
    }
}
