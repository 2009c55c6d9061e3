use super::{require, write_fields, ActionEffect, ActionHandler};
use crate::client::WorkItemClient;
use crate::context::WorkItemContext;
use crate::error::Result;
use crate::rule::RuleActionSpec;
use crate::session::ChangeType;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// `TransitionToState { NewState, Reason?, Comment? }`. The comment is posted
/// after the state write and its failure does not fail the action.
pub struct TransitionToStateAction {
    client: Arc<dyn WorkItemClient>,
}

impl TransitionToStateAction {
    pub fn new(client: Arc<dyn WorkItemClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for TransitionToStateAction {
    fn name(&self) -> &'static str {
        "TransitionToState"
    }

    async fn execute(
        &self,
        ctx: &mut WorkItemContext,
        action: &RuleActionSpec,
    ) -> Result<ActionEffect> {
        let new_state = match require(action, "NewState", ctx.id) {
            Ok(s) => s.trim().to_string(),
            Err(skip) => return Ok(skip),
        };

        let mut writes = vec![("System.State".to_string(), new_state.clone())];
        if let Some(reason) = action.get_non_blank("Reason") {
            writes.push(("System.Reason".to_string(), reason.trim().to_string()));
        }
        let changes = write_fields(self.client.as_ref(), ctx, writes, ChangeType::State).await?;

        if let Some(comment) = action.get_non_blank("Comment") {
            if let Err(e) = self.client.add_comment(ctx.id, comment, &ctx.project()).await {
                warn!(
                    work_item = ctx.id,
                    state = %new_state,
                    "transition comment failed: {e}"
                );
            }
        }
        Ok(ActionEffect::changed(changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::tests::ctx;
    use crate::client::RecordingClient;

    fn transition() -> RuleActionSpec {
        RuleActionSpec::new("TransitionToState")
            .param("NewState", "Closed")
            .param("Reason", "Completed")
            .param("Comment", "Auto-closed")
    }

    #[tokio::test]
    async fn writes_state_and_reason_then_comments() {
        let client = Arc::new(RecordingClient::new());
        let handler = TransitionToStateAction::new(client.clone());
        let mut ctx = ctx();
        handler.execute(&mut ctx, &transition()).await.unwrap();
        let fields = client.updated_fields();
        assert_eq!(fields["System.State"], "Closed");
        assert_eq!(fields["System.Reason"], "Completed");
        assert_eq!(client.comments(), vec!["Auto-closed".to_string()]);
        assert_eq!(ctx.field_str("System.State"), "Closed");
    }

    #[tokio::test]
    async fn comment_failure_is_only_a_warning() {
        let client = Arc::new(RecordingClient::new());
        client.fail_comments(true);
        let handler = TransitionToStateAction::new(client.clone());
        let effect = handler.execute(&mut ctx(), &transition()).await.unwrap();
        assert!(effect.skipped.is_none());
        assert_eq!(client.updated_fields()["System.State"], "Closed");
    }

    #[tokio::test]
    async fn state_write_failure_fails_the_action() {
        let client = Arc::new(RecordingClient::new());
        client.fail_updates(true);
        let handler = TransitionToStateAction::new(client.clone());
        assert!(handler.execute(&mut ctx(), &transition()).await.is_err());
        assert!(client.comments().is_empty());
    }

    #[tokio::test]
    async fn missing_state_skips() {
        let client = Arc::new(RecordingClient::new());
        let handler = TransitionToStateAction::new(client.clone());
        let action = RuleActionSpec::new("TransitionToState").param("Comment", "x");
        let effect = handler.execute(&mut ctx(), &action).await.unwrap();
        assert!(effect.skipped.is_some());
        assert!(client.calls().is_empty());
    }
}
