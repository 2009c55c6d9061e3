use super::{write_fields, ActionEffect, ActionHandler};
use crate::client::WorkItemClient;
use crate::context::WorkItemContext;
use crate::error::Result;
use crate::rule::RuleActionSpec;
use crate::session::ChangeType;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// `ChangeState`: every parameter is a field write, e.g.
/// `System.State = Resolved`, `System.Reason = Fixed`.
pub struct ChangeStateAction {
    client: Arc<dyn WorkItemClient>,
}

impl ChangeStateAction {
    pub fn new(client: Arc<dyn WorkItemClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for ChangeStateAction {
    fn name(&self) -> &'static str {
        "ChangeState"
    }

    async fn execute(
        &self,
        ctx: &mut WorkItemContext,
        action: &RuleActionSpec,
    ) -> Result<ActionEffect> {
        let writes: Vec<(String, String)> = action
            .parameters
            .iter()
            .filter(|p| !p.key.trim().is_empty())
            .map(|p| (p.key.trim().to_string(), p.value.clone()))
            .collect();
        if writes.is_empty() {
            warn!(work_item = ctx.id, "ChangeState without parameters, skipping");
            return Ok(ActionEffect::skipped("no fields to change"));
        }
        let changes = write_fields(self.client.as_ref(), ctx, writes, ChangeType::State).await?;
        Ok(ActionEffect::changed(changes))
    }
}
