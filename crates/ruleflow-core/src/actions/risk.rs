use super::{write_fields, ActionEffect, ActionHandler};
use crate::client::WorkItemClient;
use crate::context::WorkItemContext;
use crate::error::Result;
use crate::rule::RuleActionSpec;
use crate::session::ChangeType;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

const DEFAULT_RISK_FIELD: &str = "Microsoft.VSTS.Common.Risk";
const DEFAULT_SEVERITY_FIELD: &str = "Microsoft.VSTS.Common.Severity";
const DEFAULT_SCORE_FIELD: &str = "Custom.RiskScore";
const DEFAULT_LEVEL_FIELD: &str = "Custom.RiskLevel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl RiskLevel {
    pub fn label(self) -> &'static str {
        match self {
            RiskLevel::VeryLow => "Very Low",
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::VeryHigh => "Very High",
        }
    }
}

use RiskLevel::{High as H, Low as L, Medium as M, VeryHigh as VH, VeryLow as VL};

/// Rows are risk 1..=5, columns severity 1..=5. Non-decreasing along both.
const MATRIX: [[RiskLevel; 5]; 5] = [
    [VL, L, L, L, M],
    [L, L, L, M, M],
    [L, L, M, M, H],
    [L, M, M, H, H],
    [M, M, H, H, VH],
];

/// Leading integer of a `"<1-5> - <label>"` value.
pub fn parse_level(value: &str) -> Option<u8> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u8>().ok().filter(|n| (1..=5).contains(n))
}

pub fn risk_level(risk: u8, severity: u8) -> Option<RiskLevel> {
    let row = MATRIX.get(usize::from(risk).checked_sub(1)?)?;
    row.get(usize::from(severity).checked_sub(1)?).copied()
}

/// `RiskCalculation { RiskField?, SeverityField?, ScoreField?, LevelField? }`
pub struct RiskCalculationAction {
    client: Arc<dyn WorkItemClient>,
}

impl RiskCalculationAction {
    pub fn new(client: Arc<dyn WorkItemClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for RiskCalculationAction {
    fn name(&self) -> &'static str {
        "RiskCalculation"
    }

    async fn execute(
        &self,
        ctx: &mut WorkItemContext,
        action: &RuleActionSpec,
    ) -> Result<ActionEffect> {
        let field = |key: &str, default: &'static str| {
            action.get_non_blank(key).map(str::trim).unwrap_or(default).to_string()
        };
        let risk_field = field("RiskField", DEFAULT_RISK_FIELD);
        let severity_field = field("SeverityField", DEFAULT_SEVERITY_FIELD);

        let risk_raw = ctx.field_str(&risk_field);
        let severity_raw = ctx.field_str(&severity_field);
        let (Some(risk), Some(severity)) = (parse_level(&risk_raw), parse_level(&severity_raw))
        else {
            warn!(
                work_item = ctx.id,
                "cannot parse risk '{risk_raw}' / severity '{severity_raw}', skipping"
            );
            return Ok(ActionEffect::skipped("risk or severity not set"));
        };
        let Some(level) = risk_level(risk, severity) else {
            return Ok(ActionEffect::skipped("risk or severity out of range"));
        };

        let score = u32::from(risk) * u32::from(severity);
        let writes = vec![
            (field("ScoreField", DEFAULT_SCORE_FIELD), score.to_string()),
            (field("LevelField", DEFAULT_LEVEL_FIELD), level.label().to_string()),
        ];
        let changes = write_fields(self.client.as_ref(), ctx, writes, ChangeType::Calculate).await?;
        Ok(ActionEffect::changed(changes))
    }
}
