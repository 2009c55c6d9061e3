use super::{require, write_fields, ActionEffect, ActionHandler};
use crate::client::WorkItemClient;
use crate::context::WorkItemContext;
use crate::error::Result;
use crate::rule::RuleActionSpec;
use crate::session::ChangeType;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// `SetField { FieldName, FieldValue }`. A value of the form `{Field}` copies
/// another field; `{Field.Split}` copies the part before the first `<`
/// (identity fields render as `Name <address>`).
pub struct SetFieldAction {
    client: Arc<dyn WorkItemClient>,
}

impl SetFieldAction {
    pub fn new(client: Arc<dyn WorkItemClient>) -> Self {
        Self { client }
    }
}

/// Resolve a `{Field}` placeholder. Literals pass through, and so does a
/// placeholder whose field is absent.
pub fn resolve_value(raw: &str, ctx: &WorkItemContext) -> String {
    let trimmed = raw.trim();
    let Some(inner) = trimmed
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
    else {
        return raw.to_string();
    };

    let (field, split) = match inner.strip_suffix(".Split") {
        Some(f) => (f, true),
        None => (inner, false),
    };
    match ctx.get(field).filter(|v| !v.is_null()) {
        Some(value) => {
            let text = value.to_string();
            if split {
                text.split('<').next().unwrap_or_default().trim().to_string()
            } else {
                text
            }
        }
        None => {
            warn!(work_item = ctx.id, "placeholder field '{field}' not present, writing literal");
            raw.to_string()
        }
    }
}

#[async_trait]
impl ActionHandler for SetFieldAction {
    fn name(&self) -> &'static str {
        "SetField"
    }

    async fn execute(
        &self,
        ctx: &mut WorkItemContext,
        action: &RuleActionSpec,
    ) -> Result<ActionEffect> {
        let field = match require(action, "FieldName", ctx.id) {
            Ok(f) => f.trim().to_string(),
            Err(skip) => return Ok(skip),
        };
        let value = resolve_value(action.get("FieldValue").unwrap_or_default(), ctx);
        let changes = write_fields(
            self.client.as_ref(),
            ctx,
            vec![(field, value)],
            ChangeType::Set,
        )
        .await?;
        Ok(ActionEffect::changed(changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::tests::ctx;
    use crate::client::RecordingClient;

    #[test]
    fn placeholder_resolution() {
        let ctx = ctx().with_field("System.CreatedBy", "Dana Smith <dana@example.com>");
        assert_eq!(resolve_value("literal", &ctx), "literal");
        assert_eq!(
            resolve_value("{System.CreatedBy}", &ctx),
            "Dana Smith <dana@example.com>"
        );
        assert_eq!(resolve_value("{System.CreatedBy.Split}", &ctx), "Dana Smith");
        assert_eq!(resolve_value("{System_State}", &ctx), "New");
        assert_eq!(resolve_value("{Custom.Missing}", &ctx), "{Custom.Missing}");
    }

    #[tokio::test]
    async fn writes_and_records_old_value() {
        let client = Arc::new(RecordingClient::new());
        let handler = SetFieldAction::new(client.clone());
        let mut ctx = ctx();
        let action = RuleActionSpec::new("SetField")
            .param("FieldName", "System.State")
            .param("FieldValue", "Active");
        let effect = handler.execute(&mut ctx, &action).await.unwrap();
        assert_eq!(client.updated_fields()["System.State"], "Active");
        assert_eq!(effect.field_changes[0].old_value, "New");
        assert_eq!(effect.field_changes[0].new_value, "Active");
        assert_eq!(ctx.field_str("System_State"), "Active");
    }

    #[tokio::test]
    async fn missing_field_name_skips() {
        let client = Arc::new(RecordingClient::new());
        let handler = SetFieldAction::new(client.clone());
        let action = RuleActionSpec::new("SetField").param("FieldValue", "x");
        let effect = handler.execute(&mut ctx(), &action).await.unwrap();
        assert!(effect.skipped.is_some());
        assert!(client.calls().is_empty());
    }
}
