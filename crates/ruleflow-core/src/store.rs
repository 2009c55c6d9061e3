use crate::error::{Result, RuleflowError};
use crate::rule::RuleDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Source of rule definitions, keyed by rule set (the project name).
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Active rules of `rule_set`, ascending priority, ties in stored order.
    async fn active_rules(&self, rule_set: &str) -> Result<Vec<RuleDefinition>>;

    /// Insert or replace rules matched by name within their rule set.
    async fn upsert(&self, rules: Vec<RuleDefinition>) -> Result<UpsertSummary>;

    /// Every stored rule of `rule_set`, active or not, in stored order.
    async fn rules(&self, rule_set: &str) -> Result<Vec<RuleDefinition>>;

    /// Replace the rule called `name` in `rule_set` with `replacement`, or
    /// delete it when `replacement` is `None`. The replacement keeps the
    /// slot's position. `false` when no such rule exists.
    async fn replace_rule(
        &self,
        rule_set: &str,
        name: &str,
        replacement: Option<RuleDefinition>,
    ) -> Result<bool>;

    /// Inactive placeholders the converter left for a human to finish.
    async fn manual_review_rules(&self, rule_set: &str) -> Result<Vec<RuleDefinition>> {
        Ok(self
            .rules(rule_set)
            .await?
            .into_iter()
            .filter(RuleDefinition::awaits_review)
            .collect())
    }
}

fn select_active(rules: impl IntoIterator<Item = RuleDefinition>) -> Vec<RuleDefinition> {
    let mut active: Vec<RuleDefinition> = rules.into_iter().filter(|r| r.is_active).collect();
    active.sort_by_key(|r| r.priority);
    active
}

/// Merge `incoming` into `existing` by name. Returns (inserted, updated).
fn merge_rules(existing: &mut Vec<RuleDefinition>, incoming: Vec<RuleDefinition>) -> (usize, usize) {
    let (mut inserted, mut updated) = (0, 0);
    for rule in incoming {
        match existing.iter_mut().find(|r| r.name == rule.name) {
            Some(slot) => {
                *slot = rule;
                updated += 1;
            }
            None => {
                existing.push(rule);
                inserted += 1;
            }
        }
    }
    (inserted, updated)
}

fn validate_all(rules: &[RuleDefinition]) -> Result<()> {
    rules.iter().try_for_each(RuleDefinition::validate)
}

/// Apply a [`RuleStore::replace_rule`] to one rule set's rules.
fn replace_in(
    rules: &mut Vec<RuleDefinition>,
    name: &str,
    replacement: Option<RuleDefinition>,
) -> Result<bool> {
    let Some(at) = rules.iter().position(|r| r.name == name) else {
        return Ok(false);
    };
    match replacement {
        Some(rule) => {
            rule.validate()?;
            if rule.name != name && rules.iter().any(|r| r.name == rule.name) {
                return Err(RuleflowError::InvalidRule {
                    name: rule.name,
                    reason: "a rule with this name already exists".into(),
                });
            }
            rules[at] = rule;
        }
        None => {
            rules.remove(at);
        }
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// InMemoryRuleStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<Vec<RuleDefinition>>,
}

impl InMemoryRuleStore {
    pub fn new(rules: Vec<RuleDefinition>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn active_rules(&self, rule_set: &str) -> Result<Vec<RuleDefinition>> {
        let rules = self
            .rules
            .read()
            .map_err(|_| RuleflowError::Store("rule store lock poisoned".into()))?;
        Ok(select_active(
            rules.iter().filter(|r| r.rule_set == rule_set).cloned(),
        ))
    }

    async fn upsert(&self, rules: Vec<RuleDefinition>) -> Result<UpsertSummary> {
        validate_all(&rules)?;
        let mut stored = self
            .rules
            .write()
            .map_err(|_| RuleflowError::Store("rule store lock poisoned".into()))?;
        let mut summary = UpsertSummary::default();
        for rule in rules {
            match stored
                .iter_mut()
                .find(|r| r.name == rule.name && r.rule_set == rule.rule_set)
            {
                Some(slot) => {
                    *slot = rule;
                    summary.updated += 1;
                }
                None => {
                    stored.push(rule);
                    summary.inserted += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn rules(&self, rule_set: &str) -> Result<Vec<RuleDefinition>> {
        let rules = self
            .rules
            .read()
            .map_err(|_| RuleflowError::Store("rule store lock poisoned".into()))?;
        Ok(rules.iter().filter(|r| r.rule_set == rule_set).cloned().collect())
    }

    async fn replace_rule(
        &self,
        rule_set: &str,
        name: &str,
        replacement: Option<RuleDefinition>,
    ) -> Result<bool> {
        let mut stored = self
            .rules
            .write()
            .map_err(|_| RuleflowError::Store("rule store lock poisoned".into()))?;
        let (mut set, rest): (Vec<RuleDefinition>, Vec<RuleDefinition>) =
            std::mem::take(&mut *stored)
                .into_iter()
                .partition(|r| r.rule_set == rule_set);
        let result = replace_in(&mut set, name, replacement);
        *stored = rest;
        stored.extend(set);
        result
    }
}

// ---------------------------------------------------------------------------
// YamlRuleStore
// ---------------------------------------------------------------------------

/// One YAML file per rule set: `<dir>/<rule_set>.yaml` holding a list of
/// rule definitions.
///
/// Clones share one write lock, held across every load-modify-save, so
/// concurrent upserts through the same store never drop each other's rules.
#[derive(Debug, Clone)]
pub struct YamlRuleStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl YamlRuleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, rule_set: &str) -> PathBuf {
        let stem: String = rule_set
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let stem = if stem.is_empty() { "_default".to_string() } else { stem };
        self.dir.join(format!("{stem}.yaml"))
    }

    /// Every stored rule of `rule_set`, active or not. A missing file is an
    /// empty rule set.
    pub fn load_rule_set(&self, rule_set: &str) -> Result<Vec<RuleDefinition>> {
        let path = self.path_for(rule_set);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&path)?;
        let mut rules: Vec<RuleDefinition> = serde_yaml::from_str(&data)?;
        for rule in &mut rules {
            if rule.rule_set.is_empty() {
                rule.rule_set = rule_set.to_string();
            }
        }
        Ok(rules)
    }

    pub fn save_rule_set(&self, rule_set: &str, rules: &[RuleDefinition]) -> Result<()> {
        let data = serde_yaml::to_string(rules)?;
        crate::io::atomic_write(&self.path_for(rule_set), data.as_bytes())
    }

    pub fn upsert_blocking(&self, rules: Vec<RuleDefinition>) -> Result<UpsertSummary> {
        validate_all(&rules)?;
        // The file is only ever rewritten whole, so no state is left
        // half-written by a panicking holder.
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut by_set: BTreeMap<String, Vec<RuleDefinition>> = BTreeMap::new();
        for rule in rules {
            by_set.entry(rule.rule_set.clone()).or_default().push(rule);
        }

        let mut summary = UpsertSummary::default();
        for (rule_set, incoming) in by_set {
            let mut existing = self.load_rule_set(&rule_set)?;
            let (inserted, updated) = merge_rules(&mut existing, incoming);
            self.save_rule_set(&rule_set, &existing)?;
            summary.inserted += inserted;
            summary.updated += updated;
        }
        Ok(summary)
    }

    pub fn replace_rule_blocking(
        &self,
        rule_set: &str,
        name: &str,
        replacement: Option<RuleDefinition>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut rules = self.load_rule_set(rule_set)?;
        if !replace_in(&mut rules, name, replacement)? {
            return Ok(false);
        }
        self.save_rule_set(rule_set, &rules)?;
        Ok(true)
    }
}

#[async_trait]
impl RuleStore for YamlRuleStore {
    async fn active_rules(&self, rule_set: &str) -> Result<Vec<RuleDefinition>> {
        let store = self.clone();
        let rule_set = rule_set.to_string();
        tokio::task::spawn_blocking(move || store.load_rule_set(&rule_set).map(select_active))
            .await
            .map_err(|e| RuleflowError::Store(format!("task join error: {e}")))?
    }

    async fn upsert(&self, rules: Vec<RuleDefinition>) -> Result<UpsertSummary> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.upsert_blocking(rules))
            .await
            .map_err(|e| RuleflowError::Store(format!("task join error: {e}")))?
    }

    async fn rules(&self, rule_set: &str) -> Result<Vec<RuleDefinition>> {
        let store = self.clone();
        let rule_set = rule_set.to_string();
        tokio::task::spawn_blocking(move || store.load_rule_set(&rule_set))
            .await
            .map_err(|e| RuleflowError::Store(format!("task join error: {e}")))?
    }

    async fn replace_rule(
        &self,
        rule_set: &str,
        name: &str,
        replacement: Option<RuleDefinition>,
    ) -> Result<bool> {
        let store = self.clone();
        let (rule_set, name) = (rule_set.to_string(), name.to_string());
        tokio::task::spawn_blocking(move || store.replace_rule_blocking(&rule_set, &name, replacement))
            .await
            .map_err(|e| RuleflowError::Store(format!("task join error: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rule(name: &str, priority: i32, active: bool) -> RuleDefinition {
        let mut r = RuleDefinition::new(name, "true");
        r.rule_set = "Apollo".into();
        r.priority = priority;
        r.is_active = active;
        r
    }

    fn names(rules: &[RuleDefinition]) -> Vec<&str> {
        rules.iter().map(|r| r.name.as_str()).collect()
    }

    #[tokio::test]
    async fn in_memory_sorts_stably_and_filters() {
        let store = InMemoryRuleStore::new(vec![
            rule("c", 10, true),
            rule("a", 5, true),
            rule("b", 10, true),
            rule("off", 1, false),
        ]);
        let rules = store.active_rules("Apollo").await.unwrap();
        assert_eq!(names(&rules), ["a", "c", "b"]);
        assert!(store.active_rules("Other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn in_memory_upsert() {
        let store = InMemoryRuleStore::default();
        let s = store.upsert(vec![rule("a", 1, true)]).await.unwrap();
        assert_eq!(s, UpsertSummary { inserted: 1, updated: 0 });
        let mut changed = rule("a", 1, true);
        changed.expression = "false".into();
        let s = store.upsert(vec![changed]).await.unwrap();
        assert_eq!(s, UpsertSummary { inserted: 0, updated: 1 });
        assert_eq!(store.active_rules("Apollo").await.unwrap()[0].expression, "false");
    }

    #[tokio::test]
    async fn yaml_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = YamlRuleStore::new(dir.path());
        let summary = store
            .upsert(vec![rule("b", 20, true), rule("a", 10, true), rule("z", 1, false)])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 3);
        assert!(dir.path().join("Apollo.yaml").exists());

        let rules = store.active_rules("Apollo").await.unwrap();
        assert_eq!(names(&rules), ["a", "b"]);

        let summary = store.upsert(vec![rule("a", 30, true)]).await.unwrap();
        assert_eq!(summary, UpsertSummary { inserted: 0, updated: 1 });
        let rules = store.active_rules("Apollo").await.unwrap();
        assert_eq!(names(&rules), ["b", "a"]);
    }

    #[tokio::test]
    async fn yaml_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = YamlRuleStore::new(dir.path());
        assert!(store.active_rules("Nobody").await.unwrap().is_empty());
    }

    #[test]
    fn path_is_sanitized() {
        let store = YamlRuleStore::new("/rules");
        assert_eq!(store.path_for("My Project"), PathBuf::from("/rules/My_Project.yaml"));
        assert_eq!(store.path_for(""), PathBuf::from("/rules/_default.yaml"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_yaml_upserts_are_all_kept() {
        let dir = TempDir::new().unwrap();
        let store = YamlRuleStore::new(dir.path());
        let writers: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.upsert(vec![rule(&format!("r{i}"), i, true)]).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        assert_eq!(store.rules("Apollo").await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn replace_keeps_position_and_deletes() {
        let store = InMemoryRuleStore::new(vec![rule("a", 1, true), rule("b", 2, true), rule("c", 3, true)]);
        let mut renamed = rule("b2", 2, false);
        renamed.expression = "false".into();
        assert!(store.replace_rule("Apollo", "b", Some(renamed)).await.unwrap());
        assert_eq!(names(&store.rules("Apollo").await.unwrap()), ["a", "b2", "c"]);

        assert!(store.replace_rule("Apollo", "a", None).await.unwrap());
        assert!(!store.replace_rule("Apollo", "a", None).await.unwrap());
        assert!(!store.replace_rule("Other", "c", None).await.unwrap());
        assert_eq!(names(&store.rules("Apollo").await.unwrap()), ["b2", "c"]);
    }

    #[tokio::test]
    async fn replace_rejects_name_collision() {
        let dir = TempDir::new().unwrap();
        let store = YamlRuleStore::new(dir.path());
        store.upsert(vec![rule("a", 1, true), rule("b", 2, true)]).await.unwrap();
        let err = store
            .replace_rule("Apollo", "a", Some(rule("b", 1, true)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleflowError::InvalidRule { .. }));
        assert_eq!(names(&store.rules("Apollo").await.unwrap()), ["a", "b"]);
    }

    #[tokio::test]
    async fn manual_review_rules_are_inactive_placeholders() {
        let mut pending = rule("Legacy_ManualReview", 100, false);
        pending.expression = "1 == 1".into();
        let store = InMemoryRuleStore::new(vec![
            pending,
            rule("Active_ManualReview", 1, true),
            rule("plain", 1, false),
        ]);
        let rules = store.manual_review_rules("Apollo").await.unwrap();
        assert_eq!(names(&rules), ["Legacy_ManualReview"]);
    }

    #[tokio::test]
    async fn upsert_rejects_invalid_rules() {
        let store = InMemoryRuleStore::default();
        assert!(store.upsert(vec![RuleDefinition::new("", "true")]).await.is_err());
    }
}
