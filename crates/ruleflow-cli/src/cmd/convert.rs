use crate::output::{print_json, print_table};
use anyhow::Context;
use ruleflow_core::config::Config;
use ruleflow_core::converter::{ConvertOptions, RuleConverter};
use ruleflow_core::store::YamlRuleStore;
use std::path::Path;

pub struct Options {
    pub rule_set: String,
    pub priority: Option<i32>,
    pub size_field: Option<String>,
    pub save: bool,
}

pub fn run(root: &Path, file: &Path, opts: Options, json: bool) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mut options = ConvertOptions {
        rule_set: opts.rule_set,
        ..Default::default()
    };
    if let Some(priority) = opts.priority {
        options.priority = priority;
    }
    if let Some(size_field) = opts.size_field {
        options.size_field = size_field;
    }

    let report = RuleConverter::convert(&source, &options);

    let saved = if opts.save && !report.rules.is_empty() {
        let config = Config::load_or_default(root).context("failed to load config")?;
        let store = YamlRuleStore::new(config.rules_dir(root));
        Some(store.upsert_blocking(report.rules.clone())?)
    } else {
        None
    };

    if json {
        return print_json(&serde_json::json!({
            "rules": report.rules,
            "notes": report.notes,
            "saved": saved,
        }));
    }

    if report.notes.is_empty() {
        println!("No rule blocks found in {}.", file.display());
        return Ok(());
    }

    let rows = report
        .notes
        .iter()
        .map(|n| {
            vec![
                n.rule_name.clone(),
                serde_json::to_value(n.classification)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
                n.message.clone(),
            ]
        })
        .collect();
    print_table(&["RULE", "CLASSIFICATION", "NOTE"], rows);

    if let Some(summary) = saved {
        println!(
            "\nSaved to rule set '{}': {} inserted, {} updated.",
            options.rule_set, summary.inserted, summary.updated
        );
    } else if !opts.save {
        println!("\nDry run. Pass --save to store the converted rules.");
    }
    Ok(())
}
