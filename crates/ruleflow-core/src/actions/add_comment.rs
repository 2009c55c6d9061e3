use super::{require, ActionEffect, ActionHandler};
use crate::client::WorkItemClient;
use crate::context::WorkItemContext;
use crate::error::Result;
use crate::rule::RuleActionSpec;
use async_trait::async_trait;
use std::sync::Arc;

/// `AddComment { CommentText }`
pub struct AddCommentAction {
    client: Arc<dyn WorkItemClient>,
}

impl AddCommentAction {
    pub fn new(client: Arc<dyn WorkItemClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for AddCommentAction {
    fn name(&self) -> &'static str {
        "AddComment"
    }

    async fn execute(
        &self,
        ctx: &mut WorkItemContext,
        action: &RuleActionSpec,
    ) -> Result<ActionEffect> {
        let text = match require(action, "CommentText", ctx.id) {
            Ok(t) => t,
            Err(skip) => return Ok(skip),
        };
        self.client.add_comment(ctx.id, text, &ctx.project()).await?;
        Ok(ActionEffect::done())
    }
}
