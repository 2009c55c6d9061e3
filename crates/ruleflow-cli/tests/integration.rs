#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn ruleflow(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ruleflow").unwrap();
    cmd.current_dir(dir.path()).env("RULEFLOW_ROOT", dir.path());
    cmd
}

fn write_rules(dir: &TempDir) {
    std::fs::create_dir_all(dir.path().join("rules")).unwrap();
    std::fs::write(
        dir.path().join("rules/Apollo.yaml"),
        r#"
- name: close-reason
  expression: body.Fields.System_State == "Closed"
  applies_to: Bug
  priority: 20
  actions:
    - action_name: SetField
      parameters:
        - { key: FieldName, value: System.Reason }
        - { key: FieldValue, value: Fixed }
- name: flag-open
  expression: body.Fields.System_State != "Closed"
  priority: 10
  actions:
    - action_name: AddComment
      parameters:
        - { key: CommentText, value: "still open" }
- name: retired
  expression: "true"
  is_active: false
"#,
    )
    .unwrap();
}

fn write_event(dir: &TempDir, state: &str) -> std::path::PathBuf {
    let path = dir.path().join("event.json");
    let event = serde_json::json!({
        "eventType": "workitem.updated",
        "resource": {
            "workItemId": 17,
            "revision": {
                "fields": {
                    "System.TeamProject": "Apollo",
                    "System.WorkItemType": "Bug",
                    "System.State": state,
                    "System.Title": "Crash on save"
                }
            }
        }
    });
    std::fs::write(&path, serde_json::to_vec(&event).unwrap()).unwrap();
    path
}

const LEGACY: &str = r#"<rules>
  <rule name="Flag" appliesTo="Bug">
    if (self["System.State"] == "Active") { self["Custom.Flag"] = "yes"; }
  </rule>
</rules>"#;

// ---------------------------------------------------------------------------
// ruleflow rules list
// ---------------------------------------------------------------------------

#[test]
fn rules_list_shows_active_rules_in_priority_order() {
    let dir = TempDir::new().unwrap();
    write_rules(&dir);

    let out = ruleflow(&dir)
        .args(["--json", "rules", "list", "Apollo"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let rules: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let names: Vec<&str> = rules
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["flag-open", "close-reason"]);
}

#[test]
fn rules_list_all_includes_inactive() {
    let dir = TempDir::new().unwrap();
    write_rules(&dir);
    ruleflow(&dir)
        .args(["rules", "list", "Apollo", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("retired"));
}

#[test]
fn rules_list_empty_rule_set() {
    let dir = TempDir::new().unwrap();
    ruleflow(&dir)
        .args(["rules", "list", "Nobody"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No rules in 'Nobody'"));
}

fn write_placeholder(dir: &TempDir) {
    std::fs::create_dir_all(dir.path().join("rules")).unwrap();
    std::fs::write(
        dir.path().join("rules/Apollo.yaml"),
        r#"
- name: Links_ManualReview
  expression: "true"
  is_active: false
  actions:
    - action_name: AddComment
      parameters:
        - key: CommentText
          value: "MANUAL REVIEW REQUIRED - original rule code:\nwhile (x) { y(); }"
"#,
    )
    .unwrap();
}

#[test]
fn rules_pending_lists_placeholders() {
    let dir = TempDir::new().unwrap();
    write_placeholder(&dir);
    ruleflow(&dir)
        .args(["rules", "pending", "Apollo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Links_ManualReview"))
        .stdout(predicate::str::contains("loop"));
}

#[test]
fn rules_reject_renames_placeholder() {
    let dir = TempDir::new().unwrap();
    write_placeholder(&dir);
    ruleflow(&dir)
        .args(["rules", "reject", "Apollo", "Links_ManualReview", "--reason", "obsolete"])
        .assert()
        .success()
        .stdout(predicate::str::contains("kept as Links_Rejected"));

    ruleflow(&dir)
        .args(["rules", "reject", "Apollo", "Links_ManualReview"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no pending review"));
}

// ---------------------------------------------------------------------------
// ruleflow run
// ---------------------------------------------------------------------------

#[test]
fn run_reports_session_and_recorded_calls() {
    let dir = TempDir::new().unwrap();
    write_rules(&dir);
    let event = write_event(&dir, "Closed");

    let out = ruleflow(&dir)
        .args(["--json", "run"])
        .arg(&event)
        .output()
        .unwrap();
    assert!(out.status.success());
    let body: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(body["summary"]["workItemId"], 17);
    assert_eq!(body["summary"]["passed"], 1);
    assert_eq!(body["summary"]["failed"], 1);
    assert_eq!(body["calls"][0]["kind"], "update");
    assert_eq!(body["calls"][0]["fields"]["System.Reason"], "Fixed");
}

#[test]
fn run_prints_table() {
    let dir = TempDir::new().unwrap();
    write_rules(&dir);
    let event = write_event(&dir, "Active");

    ruleflow(&dir)
        .arg("run")
        .arg(&event)
        .assert()
        .success()
        .stdout(predicate::str::contains("flag-open"))
        .stdout(predicate::str::contains("PASSED"))
        .stdout(predicate::str::contains("still open"));
}

#[test]
fn run_rejects_event_without_fields() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("event.json");
    std::fs::write(&path, r#"{"resource": {"workItemId": 3}}"#).unwrap();

    ruleflow(&dir)
        .arg("run")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid payload"));
}

// ---------------------------------------------------------------------------
// ruleflow convert / import
// ---------------------------------------------------------------------------

#[test]
fn convert_is_a_dry_run_by_default() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("legacy.xml");
    std::fs::write(&file, LEGACY).unwrap();

    ruleflow(&dir)
        .arg("convert")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("boolean-expression"))
        .stdout(predicate::str::contains("Dry run"));
    assert!(!dir.path().join("rules").exists());
}

#[test]
fn convert_save_writes_rule_set() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("legacy.xml");
    std::fs::write(&file, LEGACY).unwrap();

    ruleflow(&dir)
        .args(["convert", "--rule-set", "Apollo", "--save"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 inserted"));

    let saved = std::fs::read_to_string(dir.path().join("rules/Apollo.yaml")).unwrap();
    assert!(saved.contains("name: Flag"));
    assert!(saved.contains("body.Fields.System_State"));
}

#[test]
fn import_stores_script_rules() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("legacy.xml");
    std::fs::write(&file, LEGACY).unwrap();

    let out = ruleflow(&dir)
        .args(["--json", "import", "--rule-set", "Apollo", "--priority", "3"])
        .arg(&file)
        .output()
        .unwrap();
    assert!(out.status.success());
    let body: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(body["inserted"], 1);
    assert_eq!(body["rules"][0], "Flag");

    let saved = std::fs::read_to_string(dir.path().join("rules/Apollo.yaml")).unwrap();
    assert!(saved.contains("ScriptRule("));
    assert!(saved.contains("priority: 3"));
}

#[test]
fn convert_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    ruleflow(&dir)
        .args(["convert", "nope.xml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

// ---------------------------------------------------------------------------
// ruleflow config
// ---------------------------------------------------------------------------

#[test]
fn config_validate_clean() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("ruleflow.yaml"),
        "tracker:\n  organization_url: https://dev.example.com/acme\n",
    )
    .unwrap();
    ruleflow(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_reports_errors() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("ruleflow.yaml"),
        "guard:\n  max_per_hour: 0\n",
    )
    .unwrap();
    ruleflow(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] guard.max_per_hour"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_validate_requires_file() {
    let dir = TempDir::new().unwrap();
    ruleflow(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn config_show_prints_defaults() {
    let dir = TempDir::new().unwrap();
    let out = ruleflow(&dir)
        .args(["--json", "config", "show"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let cfg: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(cfg["server"]["port"], 7420);
    assert_eq!(cfg["rules"]["dir"], "rules");
}
