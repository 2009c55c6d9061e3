use super::{require, write_fields, ActionEffect, ActionHandler};
use crate::client::WorkItemClient;
use crate::context::{format_number, keys, WorkItemContext};
use crate::error::Result;
use crate::rule::RuleActionSpec;
use crate::session::ChangeType;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    Set,
    Append,
    Prepend,
    Calculate,
}

impl UpdateType {
    /// Unknown or missing types fall back to `Set`.
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(|s| s.trim().to_ascii_uppercase()).as_deref() {
            Some("APPEND") => UpdateType::Append,
            Some("PREPEND") => UpdateType::Prepend,
            Some("CALCULATE") => UpdateType::Calculate,
            _ => UpdateType::Set,
        }
    }

    fn change_type(self) -> ChangeType {
        match self {
            UpdateType::Set => ChangeType::Set,
            UpdateType::Append => ChangeType::Append,
            UpdateType::Prepend => ChangeType::Prepend,
            UpdateType::Calculate => ChangeType::Calculate,
        }
    }
}

/// Size bucket for an effort estimate.
pub fn effort_to_size(effort: f64) -> &'static str {
    if effort <= 25.0 {
        "small"
    } else if effort < 65.0 {
        "medium"
    } else {
        "large"
    }
}

/// Evaluate a CALCULATE formula. `None` means there is nothing to write.
pub fn calculate(formula: &str, current: &str, ctx: &WorkItemContext) -> Option<String> {
    let formula = formula.trim();
    if formula.eq_ignore_ascii_case("EFFORT_TO_SIZE") {
        let effort = ctx.get(keys::EFFORT).and_then(|v| v.as_f64())?;
        return Some(effort_to_size(effort).to_string());
    }

    let arithmetic = |operand: &str, op: fn(f64, f64) -> f64| -> String {
        match (current.trim().parse::<f64>(), operand.trim().parse::<f64>()) {
            (Ok(a), Ok(b)) => format_number(op(a, b)),
            _ => current.to_string(),
        }
    };
    let upper = formula.to_ascii_uppercase();
    if upper.starts_with("ADD:") {
        return Some(arithmetic(&formula[4..], |a, b| a + b));
    }
    if upper.starts_with("MULTIPLY:") {
        return Some(arithmetic(&formula[9..], |a, b| a * b));
    }
    Some(formula.to_string())
}

/// `UpdateField { FieldName, UpdateType, Value }`
pub struct UpdateFieldAction {
    client: Arc<dyn WorkItemClient>,
}

impl UpdateFieldAction {
    pub fn new(client: Arc<dyn WorkItemClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for UpdateFieldAction {
    fn name(&self) -> &'static str {
        "UpdateField"
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
        let update_type = UpdateType::parse(action.get("UpdateType"));
        let value = action.get("Value").unwrap_or_default();
        let current = ctx.field_str(&field);

        let new_value = match update_type {
            UpdateType::Set => value.to_string(),
            UpdateType::Append => format!("{current}{value}"),
            UpdateType::Prepend => format!("{value}{current}"),
            UpdateType::Calculate => match calculate(value, &current, ctx) {
                Some(v) => v,
                None => {
                    warn!(work_item = ctx.id, field = %field, "nothing to calculate for '{value}'");
                    return Ok(ActionEffect::skipped(format!("no input for {value}")));
                }
            },
        };

        let changes = write_fields(
            self.client.as_ref(),
            ctx,
            vec![(field, new_value)],
            update_type.change_type(),
        )
        .await?;
        Ok(ActionEffect::changed(changes))
    }
}
