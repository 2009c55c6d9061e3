use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use ruleflow_core::config::Config;
use ruleflow_core::review::{pending_reviews, reject_review, RejectOutcome, ReviewRejection};
use ruleflow_core::store::{RuleStore, YamlRuleStore};
use std::path::Path;

#[derive(Subcommand)]
pub enum RulesSubcommand {
    /// List the rules of a rule set in evaluation order
    List {
        /// Rule set (project) name
        rule_set: String,
        /// Include inactive rules
        #[arg(long)]
        all: bool,
    },
    /// List converted rules waiting for manual review
    Pending {
        /// Rule set (project) name
        rule_set: String,
    },
    /// Reject a rule waiting for manual review
    Reject {
        /// Rule set (project) name
        rule_set: String,
        /// Placeholder name, e.g. Links_ManualReview
        name: String,
        /// Delete the placeholder instead of keeping it as <name>_Rejected
        #[arg(long)]
        delete: bool,
        /// Why the rule was rejected
        #[arg(long, default_value = "")]
        reason: String,
    },
}

pub fn run(root: &Path, subcmd: RulesSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        RulesSubcommand::List { rule_set, all } => list(root, &rule_set, all, json),
        RulesSubcommand::Pending { rule_set } => pending(root, &rule_set, json),
        RulesSubcommand::Reject {
            rule_set,
            name,
            delete,
            reason,
        } => reject(root, &rule_set, &name, delete, reason, json),
    }
}

fn open_store(root: &Path) -> anyhow::Result<YamlRuleStore> {
    let config = Config::load_or_default(root).context("failed to load config")?;
    Ok(YamlRuleStore::new(config.rules_dir(root)))
}

fn pending(root: &Path, rule_set: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let rt = tokio::runtime::Runtime::new()?;
    let pending = rt.block_on(pending_reviews(&store, rule_set))?;

    if json {
        return print_json(&pending);
    }
    if pending.is_empty() {
        println!("Nothing waiting for review in '{rule_set}'.");
        return Ok(());
    }
    let rows = pending
        .iter()
        .map(|p| {
            vec![
                p.rule_name.clone(),
                p.applies_to.clone(),
                p.complexity_reasons.join(", "),
            ]
        })
        .collect();
    print_table(&["NAME", "APPLIES TO", "REASONS"], rows);
    Ok(())
}

fn reject(
    root: &Path,
    rule_set: &str,
    name: &str,
    delete: bool,
    reason: String,
    json: bool,
) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let rejection = ReviewRejection {
        delete_rule: delete,
        rejection_reason: reason,
        reviewer_name: std::env::var("USER").unwrap_or_default(),
    };
    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(reject_review(&store, rule_set, name, rejection))?;

    if json {
        return print_json(&outcome);
    }
    match outcome {
        RejectOutcome::Deleted => println!("Deleted {name}."),
        RejectOutcome::Deactivated { rule_name } => println!("Rejected {name}; kept as {rule_name}."),
    }
    Ok(())
}

fn list(root: &Path, rule_set: &str, all: bool, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;

    let rules = if all {
        store.load_rule_set(rule_set)?
    } else {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(store.active_rules(rule_set))?
    };

    if json {
        return print_json(&rules);
    }
    if rules.is_empty() {
        println!("No rules in '{rule_set}'.");
        return Ok(());
    }

    let rows = rules
        .iter()
        .map(|r| {
            vec![
                r.priority.to_string(),
                r.name.clone(),
                r.applies_to.clone(),
                if r.is_active { "yes" } else { "no" }.to_string(),
                r.actions.len().to_string(),
            ]
        })
        .collect();
    print_table(&["PRIORITY", "NAME", "APPLIES TO", "ACTIVE", "ACTIONS"], rows);
    Ok(())
}
