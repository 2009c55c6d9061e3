use crate::output::print_json;
use anyhow::Context;
use ruleflow_core::config::Config;
use ruleflow_core::converter::import_script_rules;
use ruleflow_core::store::{UpsertSummary, YamlRuleStore};
use std::path::Path;

pub fn run(
    root: &Path,
    file: &Path,
    rule_set: &str,
    priority: Option<i32>,
    json: bool,
) -> anyhow::Result<()> {
    let rule_set = rule_set.trim();
    if rule_set.is_empty() {
        anyhow::bail!("--rule-set must not be empty");
    }
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let report = import_script_rules(&source, rule_set, priority)?;
    let summary = if report.rules.is_empty() {
        UpsertSummary::default()
    } else {
        let config = Config::load_or_default(root).context("failed to load config")?;
        YamlRuleStore::new(config.rules_dir(root)).upsert_blocking(report.rules.clone())?
    };

    if json {
        return print_json(&serde_json::json!({
            "inserted": summary.inserted,
            "updated": summary.updated,
            "rules": report.rules.iter().map(|r| &r.name).collect::<Vec<_>>(),
            "rejected": report.rejected,
        }));
    }

    println!(
        "Imported into '{rule_set}': {} inserted, {} updated.",
        summary.inserted, summary.updated
    );
    for note in &report.rejected {
        println!("[rejected] {}: {}", note.rule_name, note.message);
    }
    Ok(())
}
