//! Manual review of converted rules.
//!
//! The converter stores blocks it cannot translate as inactive
//! `<name>_ManualReview` placeholders carrying the original code in an
//! AddComment action. A reviewer either completes one, replacing it with a
//! hand-written rule, or rejects it.

use crate::converter::complexity_reasons;
use crate::engine::ExpressionEngine;
use crate::error::{Result, RuleflowError};
use crate::rule::{RuleActionSpec, RuleDefinition, MANUAL_REVIEW_SUFFIX};
use crate::store::RuleStore;
use serde::{Deserialize, Serialize};
use tracing::info;

const ORIGINAL_CODE_MARKER: &str = "original rule code:\n";
const REJECTED_SUFFIX: &str = "_Rejected";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReview {
    pub rule_name: String,
    pub rule_set: String,
    pub applies_to: String,
    pub priority: i32,
    pub original_code: String,
    pub complexity_reasons: Vec<&'static str>,
}

impl PendingReview {
    fn from_rule(rule: &RuleDefinition) -> Self {
        let original_code = original_code(rule).unwrap_or_default();
        Self {
            rule_name: rule.name.clone(),
            rule_set: rule.rule_set.clone(),
            applies_to: rule.applies_to.clone(),
            priority: rule.priority,
            complexity_reasons: complexity_reasons(&original_code),
            original_code,
        }
    }
}

/// The legacy code a placeholder was created from.
fn original_code(rule: &RuleDefinition) -> Option<String> {
    rule.actions.iter().find_map(|action| {
        let text = action.get("CommentText")?;
        let at = text.find(ORIGINAL_CODE_MARKER)?;
        Some(text[at + ORIGINAL_CODE_MARKER.len()..].to_string())
    })
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCompletion {
    /// Defaults to the placeholder's name without the review suffix.
    #[serde(default)]
    pub new_rule_name: Option<String>,
    pub reviewed_expression: String,
    #[serde(default)]
    pub applies_to: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub activate_immediately: bool,
    #[serde(default)]
    pub reviewed_actions: Vec<RuleActionSpec>,
    #[serde(default)]
    pub reviewer_name: String,
    #[serde(default)]
    pub review_notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRejection {
    /// Delete the placeholder instead of keeping it as `<name>_Rejected`.
    #[serde(default)]
    pub delete_rule: bool,
    #[serde(default)]
    pub rejection_reason: String,
    #[serde(default)]
    pub reviewer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RejectOutcome {
    Deleted,
    #[serde(rename_all = "camelCase")]
    Deactivated { rule_name: String },
}

/// Placeholders of `rule_set` still waiting for a reviewer.
pub async fn pending_reviews(store: &dyn RuleStore, rule_set: &str) -> Result<Vec<PendingReview>> {
    let rules = store.manual_review_rules(rule_set).await?;
    Ok(rules.iter().map(PendingReview::from_rule).collect())
}

fn not_pending(rule_set: &str, name: &str) -> RuleflowError {
    RuleflowError::NotFound(format!("no pending review {name} in {rule_set}"))
}

async fn pending_rule(store: &dyn RuleStore, rule_set: &str, name: &str) -> Result<RuleDefinition> {
    store
        .manual_review_rules(rule_set)
        .await?
        .into_iter()
        .find(|r| r.name == name)
        .ok_or_else(|| not_pending(rule_set, name))
}

/// Swap the placeholder out, failing if it vanished since it was read.
async fn replace_placeholder(
    store: &dyn RuleStore,
    rule_set: &str,
    name: &str,
    replacement: Option<RuleDefinition>,
) -> Result<()> {
    if store.replace_rule(rule_set, name, replacement).await? {
        Ok(())
    } else {
        Err(not_pending(rule_set, name))
    }
}

/// Replace the placeholder `name` with the reviewed rule. The expression
/// must compile and at least one action is required.
pub async fn complete_review(
    store: &dyn RuleStore,
    engine: &dyn ExpressionEngine,
    rule_set: &str,
    name: &str,
    completion: ReviewCompletion,
) -> Result<RuleDefinition> {
    let placeholder = pending_rule(store, rule_set, name).await?;
    let invalid = |reason: String| RuleflowError::InvalidRule {
        name: name.to_string(),
        reason,
    };
    let expression = completion.reviewed_expression.trim();
    if expression.is_empty() {
        return Err(invalid("reviewed expression is empty".into()));
    }
    engine
        .validate(expression)
        .map_err(|e| invalid(format!("reviewed expression does not compile: {e}")))?;
    if completion.reviewed_actions.is_empty() {
        return Err(invalid("at least one reviewed action is required".into()));
    }

    let rule_name = completion
        .new_rule_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            name.strip_suffix(MANUAL_REVIEW_SUFFIX)
                .unwrap_or(name)
                .to_string()
        });
    let rule = RuleDefinition {
        name: rule_name,
        expression: expression.to_string(),
        applies_to: completion.applies_to.unwrap_or(placeholder.applies_to),
        rule_set: placeholder.rule_set,
        priority: completion.priority.unwrap_or(placeholder.priority),
        is_active: completion.activate_immediately,
        actions: completion.reviewed_actions,
    };
    replace_placeholder(store, rule_set, name, Some(rule.clone())).await?;
    info!(
        rule_set,
        placeholder = name,
        rule = %rule.name,
        reviewer = %completion.reviewer_name,
        notes = completion.review_notes.as_deref().unwrap_or(""),
        active = rule.is_active,
        "manual review completed"
    );
    Ok(rule)
}

/// Reject the placeholder `name`: delete it, or keep it inactive under a
/// `_Rejected` name so it no longer shows as pending.
pub async fn reject_review(
    store: &dyn RuleStore,
    rule_set: &str,
    name: &str,
    rejection: ReviewRejection,
) -> Result<RejectOutcome> {
    let placeholder = pending_rule(store, rule_set, name).await?;
    let outcome = if rejection.delete_rule {
        replace_placeholder(store, rule_set, name, None).await?;
        RejectOutcome::Deleted
    } else {
        let base = name.strip_suffix(MANUAL_REVIEW_SUFFIX).unwrap_or(name);
        let mut rule = placeholder;
        rule.name = format!("{base}{REJECTED_SUFFIX}");
        rule.is_active = false;
        let rule_name = rule.name.clone();
        replace_placeholder(store, rule_set, name, Some(rule)).await?;
        RejectOutcome::Deactivated { rule_name }
    };
    info!(
        rule_set,
        rule = name,
        reviewer = %rejection.reviewer_name,
        reason = %rejection.rejection_reason,
        "manual review rejected"
    );
    Ok(outcome)
}
