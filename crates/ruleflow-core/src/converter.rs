//! Heuristic conversion of legacy `<rule>` snippet blocks into structured
//! rule definitions.
//!
//! Nothing here executes the snippets. Blocks are mined for their first
//! `if (...)` condition, field assignments and state transitions; anything
//! the miner cannot represent faithfully becomes an inactive manual-review
//! placeholder carrying the original source.

use crate::error::Result;
use crate::rule::{RuleActionSpec, RuleDefinition, DEFAULT_PRIORITY, MANUAL_REVIEW_SUFFIX};
use crate::script::ScriptExecutor;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

const ALWAYS: &str = "1 == 1";
const EFFORT_PRESENT: &str = "body.Fields.Microsoft_VSTS_Scheduling_Effort != null \
     && body.Fields.Microsoft_VSTS_Scheduling_Effort != 0";

// ---------------------------------------------------------------------------
// Options and report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertOptions {
    #[serde(default = "default_rule_set")]
    pub rule_set: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Target of calculation rules whose block assigns no field.
    #[serde(default = "default_size_field")]
    pub size_field: String,
}

fn default_rule_set() -> String {
    "ConvertedRules".to_string()
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_size_field() -> String {
    "Custom.Size".to_string()
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            rule_set: default_rule_set(),
            priority: default_priority(),
            size_field: default_size_field(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    BooleanExpression,
    Calculation,
    ManualReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionNote {
    pub rule_name: String,
    pub classification: Classification,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionReport {
    pub rules: Vec<RuleDefinition>,
    pub notes: Vec<ConversionNote>,
}

// ---------------------------------------------------------------------------
// Rule blocks
// ---------------------------------------------------------------------------

/// One `<rule name=".." appliesTo="..">code</rule>` element, text decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleBlock {
    pub name: String,
    pub applies_to: String,
    pub code: String,
}

static BLOCK_RE: OnceLock<Regex> = OnceLock::new();
static ATTR_RE: OnceLock<Regex> = OnceLock::new();

/// Every `<rule>` element in `source`, in document order. Self-closing
/// elements carry no code and are ignored.
pub fn parse_blocks(source: &str) -> Vec<RuleBlock> {
    let block_re = BLOCK_RE.get_or_init(|| Regex::new(r"(?s)<rule\b((?:[^>/]|/[^>])*)>(.*?)</rule\s*>").unwrap());
    let attr_re = ATTR_RE
        .get_or_init(|| Regex::new(r#"([A-Za-z_][\w.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

    block_re
        .captures_iter(source)
        .map(|cap| {
            let mut name = None;
            let mut applies_to = None;
            for attr in attr_re.captures_iter(&cap[1]) {
                let value = attr.get(2).or_else(|| attr.get(3)).map_or("", |m| m.as_str());
                match &attr[1] {
                    "name" => name = Some(decode_entities(value)),
                    "appliesTo" => applies_to = Some(decode_entities(value)),
                    _ => {}
                }
            }
            RuleBlock {
                name: name
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| "UnnamedRule".to_string()),
                applies_to: applies_to.unwrap_or_else(|| "All".to_string()),
                code: inner_text(&cap[2]).trim().to_string(),
            }
        })
        .collect()
}

/// Element text: CDATA sections verbatim, XML comments dropped, entities
/// decoded everywhere else.
fn inner_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        let cdata = rest.find("<![CDATA[");
        let comment = rest.find("<!--");
        match (cdata, comment) {
            (Some(c), m) if m.map_or(true, |m| c < m) => {
                out.push_str(&decode_entities(&rest[..c]));
                let body = &rest[c + 9..];
                let end = body.find("]]>").unwrap_or(body.len());
                out.push_str(&body[..end]);
                rest = body.get(end + 3..).unwrap_or("");
            }
            (_, Some(m)) => {
                out.push_str(&decode_entities(&rest[..m]));
                let body = &rest[m + 4..];
                rest = body.find("-->").map_or("", |end| &body[end + 3..]);
            }
            _ => {
                out.push_str(&decode_entities(rest));
                return out;
            }
        }
    }
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').and_then(|semi| {
            let ch = match &tail[1..semi] {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                e if e.starts_with("#x") || e.starts_with("#X") => {
                    u32::from_str_radix(&e[2..], 16).ok().and_then(char::from_u32)
                }
                e if e.starts_with('#') => e[1..].parse().ok().and_then(char::from_u32),
                _ => None,
            }?;
            Some((ch, semi + 1))
        });
        match decoded {
            Some((ch, len)) => {
                out.push(ch);
                rest = &tail[len..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Snippet analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mined {
    Assignment { field: String, value: String },
    Transition { state: String, comment: Option<String> },
}

#[derive(Debug, Default)]
struct Analysis {
    conditions: Vec<String>,
    mined: Vec<Mined>,
    complex: Option<&'static str>,
    calculation: bool,
    locals: Vec<String>,
}

/// Remove `//` and `/* */` comments. String and char literals are copied
/// untouched, so `"https://wiki/x"` keeps its slashes.
fn strip_comments(code: &str) -> String {
    let bytes = code.as_bytes();
    let mut out = String::with_capacity(code.len());
    let mut kept_from = 0;
    let mut i = 0;
    while i < bytes.len() {
        if let Some(skip) = string_literal_len(bytes, i) {
            i += skip;
            continue;
        }
        let end = match (bytes[i], bytes.get(i + 1)) {
            (b'/', Some(b'/')) => code[i..].find('\n').map_or(bytes.len(), |n| i + n),
            (b'/', Some(b'*')) => code[i + 2..].find("*/").map_or(bytes.len(), |n| i + n + 4),
            _ => {
                i += 1;
                continue;
            }
        };
        out.push_str(&code[kept_from..i]);
        kept_from = end;
        i = end;
    }
    out.push_str(&code[kept_from.min(bytes.len())..]);
    out.replace("\r\n", "\n").replace('\r', "\n")
}

static COMPLEXITY: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();

fn complexity_markers() -> &'static [(Regex, &'static str)] {
    COMPLEXITY.get_or_init(|| {
        [
            (r"\bHasParent\s*\(|\bParent\s*\.", "parent traversal"),
            (r"\bDateTime\s*\.", "date/time access"),
            (r"\.Contains\s*\(", "collection lookup"),
            (r"\w\s*\[\s*\]\s*\w|\bnew\s+\w+\s*\[", "array declaration"),
            (r"\b(for|foreach|while)\s*\(|\bdo\s*\{", "loop"),
            (r"\bswitch\s*\(", "switch"),
            (r"\btry\s*\{|\bcatch\b|\bthrow\b", "exception handling"),
        ]
        .into_iter()
        .map(|(pattern, what)| (Regex::new(pattern).unwrap(), what))
        .collect()
    })
}

/// First complexity marker found, by description.
fn complexity_marker(code: &str) -> Option<&'static str> {
    complexity_markers()
        .iter()
        .find(|(re, _)| re.is_match(code))
        .map(|(_, what)| *what)
}

/// Every complexity marker in `code`, comments stripped.
pub fn complexity_reasons(code: &str) -> Vec<&'static str> {
    let code = strip_comments(code);
    complexity_markers()
        .iter()
        .filter(|(re, _)| re.is_match(&code))
        .map(|(_, what)| *what)
        .collect()
}

static NUMERIC_LOCAL_RE: OnceLock<Regex> = OnceLock::new();
static EFFORT_RE: OnceLock<Regex> = OnceLock::new();

fn is_calculation(code: &str) -> bool {
    let local = NUMERIC_LOCAL_RE.get_or_init(|| {
        Regex::new(r"\b(int|long|double|decimal|float)\s+[A-Za-z_]\w*\s*=[^=]").unwrap()
    });
    let effort = EFFORT_RE.get_or_init(|| Regex::new(r"(?i)effort|\befor").unwrap());
    local.is_match(code) || effort.is_match(code)
}

/// Conditions of every `if (...)`, in source order. The keyword must stand
/// alone (`modified(` is not an `if`), and parentheses are balanced with
/// string literals skipped.
fn extract_if_conditions(code: &str) -> Vec<String> {
    let bytes = code.as_bytes();
    let mut conditions = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if let Some(skip) = string_literal_len(bytes, i) {
            i += skip;
            continue;
        }
        let keyword = &bytes[i..i + 2] == b"if"
            && (i == 0 || !is_ident_byte(bytes[i - 1]))
            && bytes.get(i + 2).map_or(true, |b| !is_ident_byte(*b));
        if !keyword {
            i += 1;
            continue;
        }
        let mut open = i + 2;
        while open < bytes.len() && bytes[open].is_ascii_whitespace() {
            open += 1;
        }
        if bytes.get(open) != Some(&b'(') {
            i += 2;
            continue;
        }
        match matching_paren(bytes, open) {
            Some(close) => {
                let condition = code[open + 1..close].trim();
                if !condition.is_empty() {
                    debug!("found if condition: {condition}");
                    conditions.push(condition.to_string());
                }
                i = close + 1;
            }
            None => break,
        }
    }
    conditions
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Length of the string or char literal starting at `i`, if one does.
fn string_literal_len(bytes: &[u8], i: usize) -> Option<usize> {
    let quote = bytes[i];
    if quote != b'"' && quote != b'\'' {
        return None;
    }
    let mut j = i + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b if b == quote => return Some(j + 1 - i),
            _ => j += 1,
        }
    }
    Some(bytes.len() - i)
}

fn matching_paren(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        if let Some(skip) = string_literal_len(bytes, i) {
            i += skip;
            continue;
        }
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

static LOCAL_DECL_RE: OnceLock<Regex> = OnceLock::new();
static IDENT_RE: OnceLock<Regex> = OnceLock::new();

/// Names of the local variables the snippet declares.
fn declared_locals(code: &str) -> Vec<String> {
    let decl = LOCAL_DECL_RE.get_or_init(|| {
        Regex::new(r"\b(?:var|string|int|long|double|decimal|float|bool)\s+([A-Za-z_]\w*)\s*[=;]")
            .unwrap()
    });
    let mut names: Vec<String> = decl.captures_iter(code).map(|c| c[1].to_string()).collect();
    names.sort();
    names.dedup();
    names
}

/// Whether `condition` mentions any of `locals` outside string literals.
/// Such a condition cannot be evaluated against the work item alone.
fn reads_locals(condition: &str, locals: &[String]) -> bool {
    if locals.is_empty() {
        return false;
    }
    let ident = IDENT_RE.get_or_init(|| Regex::new(r"[A-Za-z_]\w*").unwrap());
    let bytes = condition.as_bytes();
    let mut code = String::with_capacity(condition.len());
    let mut kept_from = 0;
    let mut i = 0;
    while i < bytes.len() {
        match string_literal_len(bytes, i) {
            Some(skip) => {
                code.push_str(&condition[kept_from..i]);
                code.push(' ');
                i += skip;
                kept_from = i.min(bytes.len());
            }
            None => i += 1,
        }
    }
    code.push_str(&condition[kept_from..]);
    ident
        .find_iter(&code)
        .any(|m| locals.iter().any(|l| l == m.as_str()))
}

static INDEX_ASSIGN_RE: OnceLock<Regex> = OnceLock::new();
static FIELDS_ASSIGN_RE: OnceLock<Regex> = OnceLock::new();
static TRANSITION_RE: OnceLock<Regex> = OnceLock::new();

/// Assignments and transitions as separate statements, in source order.
fn mine_statements(code: &str) -> Vec<Mined> {
    let index = INDEX_ASSIGN_RE.get_or_init(|| {
        Regex::new(r#"\bself\s*\[\s*"([^"]+)"\s*\]\s*=\s*([^=;][^;]*);"#).unwrap()
    });
    let fields = FIELDS_ASSIGN_RE.get_or_init(|| {
        Regex::new(r#"\bself\.Fields\s*\[\s*"([^"]+)"\s*\]\.Value\s*=\s*([^=;][^;]*);"#).unwrap()
    });
    let transition = TRANSITION_RE.get_or_init(|| {
        Regex::new(r#"\bself\.TransitionToState\(\s*"([^"]+)"\s*(?:,\s*"([^"]*)"\s*)?\)"#).unwrap()
    });

    let mut found: Vec<(usize, Mined)> = Vec::new();
    for re in [index, fields] {
        for cap in re.captures_iter(code) {
            let at = cap.get(0).map_or(0, |m| m.start());
            found.push((
                at,
                Mined::Assignment {
                    field: cap[1].to_string(),
                    value: cap[2].trim().to_string(),
                },
            ));
        }
    }
    for cap in transition.captures_iter(code) {
        let at = cap.get(0).map_or(0, |m| m.start());
        found.push((
            at,
            Mined::Transition {
                state: cap[1].to_string(),
                comment: cap
                    .get(2)
                    .map(|m| m.as_str().to_string())
                    .filter(|c| !c.trim().is_empty()),
            },
        ));
    }
    found.sort_by_key(|(at, _)| *at);
    found.into_iter().map(|(_, m)| m).collect()
}

fn analyze(code: &str) -> Analysis {
    let clean = strip_comments(code);
    Analysis {
        conditions: extract_if_conditions(&clean),
        mined: mine_statements(&clean),
        complex: complexity_marker(&clean),
        calculation: is_calculation(&clean),
        locals: declared_locals(&clean),
    }
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

static CAST_RE: OnceLock<Regex> = OnceLock::new();
static FIELDS_VALUE_RE: OnceLock<Regex> = OnceLock::new();
static FIELDS_INDEX_RE: OnceLock<Regex> = OnceLock::new();
static SELF_INDEX_RE: OnceLock<Regex> = OnceLock::new();
static NULL_OR_EMPTY_RE: OnceLock<Regex> = OnceLock::new();

/// Rewrite a snippet condition into the expression language.
pub fn translate_condition(condition: &str) -> String {
    let cast = CAST_RE.get_or_init(|| {
        Regex::new(r"\(\s*(string|int|long|double|float|decimal|bool)\s*\)").unwrap()
    });
    let fields_value = FIELDS_VALUE_RE
        .get_or_init(|| Regex::new(r#"self\.Fields\s*\[\s*"([^"]+)"\s*\]\.Value"#).unwrap());
    let fields_index = FIELDS_INDEX_RE
        .get_or_init(|| Regex::new(r#"self\.Fields\s*\[\s*"([^"]+)"\s*\]"#).unwrap());
    let self_index =
        SELF_INDEX_RE.get_or_init(|| Regex::new(r#"self\s*\[\s*"([^"]+)"\s*\]"#).unwrap());
    let null_or_empty =
        NULL_OR_EMPTY_RE.get_or_init(|| Regex::new(r"\b([Ss]tring)\.IsNullOrEmpty\b").unwrap());

    let to_field = |cap: &regex::Captures| format!("body.Fields.{}", cap[1].replace('.', "_"));
    let out = cast.replace_all(condition, "");
    let out = fields_value.replace_all(&out, to_field);
    let out = fields_index.replace_all(&out, to_field);
    let out = self_index.replace_all(&out, to_field);
    let out = null_or_empty.replace_all(&out, "$1.IsNullOrWhiteSpace");
    out.trim().to_string()
}

static FIELD_READ_RE: OnceLock<Regex> = OnceLock::new();

/// SetField value for an assigned snippet expression: a quoted literal is
/// unquoted, a lone field read becomes a `{Field}` placeholder, anything
/// else is kept verbatim.
fn literal_value(raw: &str) -> String {
    let read = FIELD_READ_RE.get_or_init(|| {
        Regex::new(r#"^self(?:\.Fields)?\s*\[\s*"([^"]+)"\s*\](?:\.Value)?$"#).unwrap()
    });
    let raw = raw.trim();
    if let Some(cap) = read.captures(raw) {
        return format!("{{{}}}", &cap[1]);
    }
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return raw[1..raw.len() - 1].replace("\\\"", "\"");
    }
    raw.to_string()
}

// ---------------------------------------------------------------------------
// RuleConverter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleConverter;

impl RuleConverter {
    pub fn convert(source: &str, options: &ConvertOptions) -> ConversionReport {
        let mut report = ConversionReport::default();
        let blocks = parse_blocks(source);
        if blocks.is_empty() {
            warn!("no <rule> blocks found in converter input");
        }
        for block in blocks {
            let (rule, note) = Self::convert_block(&block, options);
            info!(rule = %rule.name, classification = ?note.classification, "converted rule block");
            report.rules.push(rule);
            report.notes.push(note);
        }
        report
    }

    pub fn convert_block(block: &RuleBlock, options: &ConvertOptions) -> (RuleDefinition, ConversionNote) {
        let analysis = analyze(&block.code);
        let note = |rule: &RuleDefinition, classification, message: String| ConversionNote {
            rule_name: rule.name.clone(),
            classification,
            message,
        };

        if let Some(marker) = analysis.complex {
            let rule = manual_review(block, options);
            let n = note(&rule, Classification::ManualReview, format!("{marker} needs manual review"));
            return (rule, n);
        }

        // A condition over snippet locals (`efor <= 25`) says nothing the
        // work item alone can answer; only then is a calculation considered.
        let condition = analysis.conditions.first();
        if let Some(condition) = condition.filter(|c| !reads_locals(c, &analysis.locals)) {
            let rule = boolean_rule(block, options, condition, &analysis);
            let n = note(
                &rule,
                Classification::BooleanExpression,
                format!("converted with {} action(s)", rule.actions.len()),
            );
            return (rule, n);
        }

        if analysis.calculation {
            let rule = calculation(block, options, &analysis);
            let n = note(&rule, Classification::Calculation, "converted to EFFORT_TO_SIZE calculation".into());
            return (rule, n);
        }

        if condition.is_some() {
            let rule = manual_review(block, options);
            let n = note(&rule, Classification::ManualReview, "condition reads local variables".into());
            return (rule, n);
        }

        let rule = manual_review(block, options);
        let n = note(&rule, Classification::ManualReview, "no extractable condition".into());
        (rule, n)
    }
}

fn base_rule(name: String, expression: &str, block: &RuleBlock, options: &ConvertOptions) -> RuleDefinition {
    let mut rule = RuleDefinition::new(name, expression);
    rule.applies_to = block.applies_to.clone();
    rule.rule_set = options.rule_set.clone();
    rule.priority = options.priority;
    rule
}

fn boolean_rule(
    block: &RuleBlock,
    options: &ConvertOptions,
    condition: &str,
    analysis: &Analysis,
) -> RuleDefinition {
    let mut rule = base_rule(block.name.clone(), &translate_condition(condition), block, options);
    for (i, mined) in analysis.mined.iter().enumerate() {
        let order = i as i32 + 1;
        let action = match mined {
            Mined::Assignment { field, value } => RuleActionSpec::new("SetField")
                .order(order)
                .param("FieldName", field.as_str())
                .param("FieldValue", literal_value(value)),
            Mined::Transition { state, comment } => {
                let action = RuleActionSpec::new("TransitionToState")
                    .order(order)
                    .param("NewState", state.as_str());
                match comment {
                    Some(c) => action.param("Comment", c.as_str()),
                    None => action,
                }
            }
        };
        rule.actions.push(action);
    }
    rule
}

fn calculation(block: &RuleBlock, options: &ConvertOptions, analysis: &Analysis) -> RuleDefinition {
    let target = analysis
        .mined
        .iter()
        .find_map(|m| match m {
            Mined::Assignment { field, .. } => Some(field.clone()),
            Mined::Transition { .. } => None,
        })
        .unwrap_or_else(|| options.size_field.clone());
    base_rule(block.name.clone(), EFFORT_PRESENT, block, options).with_action(
        RuleActionSpec::new("UpdateField")
            .param("FieldName", target)
            .param("UpdateType", "CALCULATE")
            .param("Value", "EFFORT_TO_SIZE"),
    )
}

fn manual_review(block: &RuleBlock, options: &ConvertOptions) -> RuleDefinition {
    let mut rule = base_rule(format!("{}{MANUAL_REVIEW_SUFFIX}", block.name), ALWAYS, block, options)
        .with_action(RuleActionSpec::new("AddComment").param(
            "CommentText",
            format!("MANUAL REVIEW REQUIRED - original rule code:\n{}", block.code),
        ));
    rule.is_active = false;
    rule
}

// ---------------------------------------------------------------------------
// Script import
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub rules: Vec<RuleDefinition>,
    /// Blocks whose code did not parse, with the parse error.
    pub rejected: Vec<ConversionNote>,
}

/// Wrap every block unchanged as a script rule. Blocks whose code does not
/// parse in the script language are rejected rather than imported.
pub fn import_script_rules(source: &str, rule_set: &str, priority: Option<i32>) -> Result<ImportReport> {
    let mut report = ImportReport {
        rules: Vec::new(),
        rejected: Vec::new(),
    };
    for block in parse_blocks(source) {
        if let Err(e) = ScriptExecutor::compile(&block.name, &block.code) {
            warn!(rule = %block.name, "rejecting script rule: {e}");
            report.rejected.push(ConversionNote {
                rule_name: block.name.clone(),
                classification: Classification::ManualReview,
                message: e.to_string(),
            });
            continue;
        }
        let mut rule = RuleDefinition::script(&block.name, &block.code, &block.applies_to);
        rule.rule_set = rule_set.to_string();
        rule.priority = priority.unwrap_or(DEFAULT_PRIORITY);
        rule.validate()?;
        report.rules.push(rule);
    }
    info!(
        imported = report.rules.len(),
        rejected = report.rejected.len(),
        "script rules imported"
    );
    Ok(report)
}
