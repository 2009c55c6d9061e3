use crate::error::{Result, RuleflowError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Expression prefix marking a rule whose logic lives in a script snippet.
pub const SCRIPT_RULE_PREFIX: &str = "ScriptRule(";
const LEGACY_SCRIPT_RULE_PREFIX: &str = "XmlCalculationRule(";

/// Action name that hands a snippet to the script executor.
pub const SCRIPT_ACTION: &str = "ExecuteXmlCalculation";
pub const SCRIPT_NAME_PARAM: &str = "RuleName";
pub const SCRIPT_SOURCE_PARAM: &str = "ScriptSource";

pub const DEFAULT_PRIORITY: i32 = 100;

/// Name suffix of the inactive placeholders left for a human reviewer.
pub const MANUAL_REVIEW_SUFFIX: &str = "_ManualReview";

// ---------------------------------------------------------------------------
// ConditionType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    #[default]
    Success,
    Failure,
}

impl ConditionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionType::Success => "Success",
            ConditionType::Failure => "Failure",
        }
    }
}

// ---------------------------------------------------------------------------
// RuleActionSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParam {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleActionSpec {
    pub action_name: String,
    #[serde(default)]
    pub condition_type: ConditionType,
    #[serde(default = "default_execution_order")]
    pub execution_order: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ActionParam>,
}

fn default_execution_order() -> i32 {
    1
}

impl RuleActionSpec {
    pub fn new(action_name: impl Into<String>) -> Self {
        Self {
            action_name: action_name.into(),
            condition_type: ConditionType::Success,
            execution_order: default_execution_order(),
            parameters: Vec::new(),
        }
    }

    pub fn on_failure(mut self) -> Self {
        self.condition_type = ConditionType::Failure;
        self
    }

    pub fn order(mut self, execution_order: i32) -> Self {
        self.execution_order = execution_order;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(ActionParam {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Parameter lookup; exact key first, then case-insensitive.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.key == key)
            .or_else(|| {
                self.parameters
                    .iter()
                    .find(|p| p.key.eq_ignore_ascii_case(key))
            })
            .map(|p| p.value.as_str())
    }

    /// Parameter value when present and not blank.
    pub fn get_non_blank(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// RuleDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    pub expression: String,
    #[serde(default = "default_applies_to")]
    pub applies_to: String,
    #[serde(default)]
    pub rule_set: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub actions: Vec<RuleActionSpec>,
}

fn default_applies_to() -> String {
    "All".to_string()
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_active() -> bool {
    true
}

impl RuleDefinition {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
            applies_to: default_applies_to(),
            rule_set: String::new(),
            priority: DEFAULT_PRIORITY,
            is_active: true,
            actions: Vec::new(),
        }
    }

    /// Wrap a legacy snippet as a script rule: sentinel expression plus a
    /// single script action carrying the source.
    pub fn script(name: &str, source: &str, applies_to: &str) -> Self {
        let mut rule = Self::new(name, format!("{SCRIPT_RULE_PREFIX}\"{name}\")"));
        rule.applies_to = applies_to.to_string();
        rule.actions.push(
            RuleActionSpec::new(SCRIPT_ACTION)
                .param(SCRIPT_NAME_PARAM, name)
                .param(SCRIPT_SOURCE_PARAM, source),
        );
        rule
    }

    pub fn with_action(mut self, action: RuleActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    /// Inactive placeholder still waiting for a reviewer.
    pub fn awaits_review(&self) -> bool {
        !self.is_active && self.name.ends_with(MANUAL_REVIEW_SUFFIX)
    }

    pub fn is_script_rule(&self) -> bool {
        let expr = self.expression.trim_start();
        starts_with_ignore_case(expr, SCRIPT_RULE_PREFIX)
            || starts_with_ignore_case(expr, LEGACY_SCRIPT_RULE_PREFIX)
    }

    /// Applicability against a work item type: blank or `All` matches
    /// everything, otherwise a trimmed, case-insensitive comma list.
    pub fn applies_to_type(&self, work_item_type: &str) -> bool {
        let spec = self.applies_to.trim();
        if spec.is_empty() {
            return true;
        }
        let wanted = work_item_type.trim();
        spec.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .any(|t| t.eq_ignore_ascii_case("all") || t.eq_ignore_ascii_case(wanted))
    }

    /// Actions tagged with `condition`, in ascending execution order.
    /// Ties keep their declaration order.
    pub fn actions_for(&self, condition: ConditionType) -> Vec<&RuleActionSpec> {
        let mut actions: Vec<&RuleActionSpec> = self
            .actions
            .iter()
            .filter(|a| a.condition_type == condition)
            .collect();
        actions.sort_by_key(|a| a.execution_order);
        actions
    }

    /// The script action of a script rule.
    pub fn script_action(&self) -> Option<&RuleActionSpec> {
        self.actions
            .iter()
            .find(|a| a.action_name.eq_ignore_ascii_case(SCRIPT_ACTION))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| RuleflowError::InvalidRule {
            name: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name is empty".into()));
        }
        if self.expression.trim().is_empty() {
            return Err(invalid("expression is empty".into()));
        }
        for action in &self.actions {
            if action.action_name.trim().is_empty() {
                return Err(invalid("action with empty name".into()));
            }
            let mut seen = HashSet::new();
            for p in &action.parameters {
                if !seen.insert(p.key.as_str()) {
                    return Err(invalid(format!(
                        "duplicate parameter '{}' on action '{}'",
                        p.key, action.action_name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn starts_with_ignore_case(haystack: &str, prefix: &str) -> bool {
    haystack
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_for(applies_to: &str) -> RuleDefinition {
        let mut r = RuleDefinition::new("r", "true");
        r.applies_to = applies_to.to_string();
        r
    }

    #[test]
    fn applies_to_wildcards() {
        assert!(rule_for("").applies_to_type("Bug"));
        assert!(rule_for("  ").applies_to_type("Bug"));
        assert!(rule_for("All").applies_to_type("Bug"));
        assert!(rule_for("all").applies_to_type(""));
    }

    #[test]
    fn applies_to_list_is_trimmed_and_case_insensitive() {
        let r = rule_for("Bug, Task ,User Story");
        assert!(r.applies_to_type("bug"));
        assert!(r.applies_to_type("TASK"));
        assert!(r.applies_to_type("User Story"));
        assert!(!r.applies_to_type("Epic"));
    }

    #[test]
    fn script_rule_detection() {
        assert!(RuleDefinition::script("calc", "return;", "All").is_script_rule());
        assert!(RuleDefinition::new("x", "  xmlcalculationrule(\"x\")").is_script_rule());
        assert!(!RuleDefinition::new("x", "body.Fields.A == 1").is_script_rule());
    }

    #[test]
    fn actions_for_sorts_stably_by_order() {
        let r = RuleDefinition::new("r", "true")
            .with_action(RuleActionSpec::new("B").order(2))
            .with_action(RuleActionSpec::new("A").order(1))
            .with_action(RuleActionSpec::new("C").order(2))
            .with_action(RuleActionSpec::new("F").on_failure());
        let names: Vec<_> = r
            .actions_for(ConditionType::Success)
            .iter()
            .map(|a| a.action_name.as_str())
            .collect();
        assert_eq!(names, ["A", "B", "C"]);
        assert_eq!(r.actions_for(ConditionType::Failure).len(), 1);
    }

    #[test]
    fn param_lookup_falls_back_to_case_insensitive() {
        let a = RuleActionSpec::new("SetField").param("FieldName", "System.Title");
        assert_eq!(a.get("FieldName"), Some("System.Title"));
        assert_eq!(a.get("fieldname"), Some("System.Title"));
        assert_eq!(a.get("Missing"), None);
    }

    #[test]
    fn validate_rejects_duplicate_params() {
        let r = RuleDefinition::new("r", "true").with_action(
            RuleActionSpec::new("SetField")
                .param("FieldName", "a")
                .param("FieldName", "b"),
        );
        assert!(r.validate().is_err());
        assert!(RuleDefinition::new("", "true").validate().is_err());
        assert!(RuleDefinition::new("ok", "true").validate().is_ok());
    }

    #[test]
    fn yaml_defaults() {
        let yaml = "name: r\nexpression: \"true\"\nactions:\n  - action_name: AddComment\n";
        let r: RuleDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(r.priority, DEFAULT_PRIORITY);
        assert!(r.is_active);
        assert_eq!(r.applies_to, "All");
        assert_eq!(r.actions[0].execution_order, 1);
        assert_eq!(r.actions[0].condition_type, ConditionType::Success);
    }
}
