//! Rule expressions, evaluated by an embedded `rhai` engine.
//!
//! Rules are written in the legacy condition dialect: `body.Fields.X`,
//! `self["X"]`, `string.IsNullOrEmpty(..)`, C-style casts and `null`. A
//! token-level rewrite turns that into a rhai expression over a constant
//! `fields` map, and the dialect's loose comparisons and helpers are
//! registered on the engine. Only expressions compile, so a rule can never
//! declare variables, loop, define functions or touch the host.

use crate::context::{format_number, internal_key, FieldValue, WorkItemContext};
use crate::error::{Result, RuleflowError};
use crate::script::ast::{Builtin, CastType};
use crate::script::lexer::{tokenize, TokenKind};
use regex::Regex;
use rhai::{
    Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Scope, AST, FLOAT, INT,
};

type RhaiResultOf<T> = std::result::Result<T, Box<EvalAltResult>>;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Evaluates a rule's boolean expression against a work item.
pub trait ExpressionEngine: Send + Sync {
    /// `Ok(true)` for PASSED, `Ok(false)` for FAILED. Malformed expressions
    /// and non-boolean results are errors.
    fn evaluate(&self, expression: &str, ctx: &WorkItemContext) -> Result<bool>;

    /// Compile `expression` without evaluating it.
    fn validate(&self, expression: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// DefaultExpressionEngine
// ---------------------------------------------------------------------------

const MAX_EXPR_DEPTH: usize = 64;
const MAX_OPERATIONS: u64 = 100_000;
const MAX_STRING_SIZE: usize = 1 << 20;
const MAX_ARRAY_SIZE: usize = 10_000;

/// The built-in engine. One instance is shared by every rule evaluation.
pub struct DefaultExpressionEngine {
    engine: Engine,
}

impl Default for DefaultExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultExpressionEngine {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine
            .set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH / 2)
            .set_max_operations(MAX_OPERATIONS)
            .set_max_string_size(MAX_STRING_SIZE)
            .set_max_array_size(MAX_ARRAY_SIZE)
            // Registered comparison overloads must win over the built-in
            // string ordering.
            .set_fast_operators(false)
            .on_print(|_| {})
            .on_debug(|_, _, _| {});
        engine.disable_symbol("eval");
        register_helpers(&mut engine);
        register_comparisons(&mut engine);
        Self { engine }
    }

    fn compile(&self, expression: &str) -> Result<AST> {
        if expression.trim().is_empty() {
            return Err(RuleflowError::Expression {
                offset: 0,
                message: "empty expression".into(),
            });
        }
        let source = to_rhai(expression)?;
        self.engine
            .compile_expression(&source)
            .map_err(|e| RuleflowError::Expression {
                offset: 0,
                message: e.to_string(),
            })
    }
}

impl ExpressionEngine for DefaultExpressionEngine {
    fn evaluate(&self, expression: &str, ctx: &WorkItemContext) -> Result<bool> {
        let ast = self.compile(expression)?;
        let mut scope = Scope::new();
        scope.push_constant("fields", fields_map(ctx));
        let value = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|e| RuleflowError::evaluation(e.to_string()))?;
        value.as_bool().map_err(|found| {
            RuleflowError::evaluation(format!("expression produced {found}, expected a boolean"))
        })
    }

    fn validate(&self, expression: &str) -> Result<()> {
        self.compile(expression).map(|_| ())
    }
}

fn fields_map(ctx: &WorkItemContext) -> Map {
    ctx.fields
        .iter()
        .map(|(key, value)| {
            let value = match value {
                FieldValue::String(s) => Dynamic::from(ImmutableString::from(s.as_str())),
                FieldValue::Number(n) => Dynamic::from_float(*n),
                FieldValue::Bool(b) => Dynamic::from_bool(*b),
                FieldValue::Null => Dynamic::UNIT,
            };
            (key.as_str().into(), value)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Dialect rewrite
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Token(TokenKind),
    /// `fields["key"]`, by internal key.
    Field(String),
    /// A function registered on the engine.
    Call(&'static str),
}

/// Rewrite a dialect expression into rhai source.
fn to_rhai(expression: &str) -> Result<String> {
    let tokens: Vec<TokenKind> = tokenize(expression)?
        .into_iter()
        .map(|t| t.kind)
        .filter(|k| *k != TokenKind::Eof)
        .collect();
    let mut pieces = lower(&tokens);
    apply_casts(&mut pieces);
    Ok(render(&pieces))
}

/// Field references and static calls, left to right.
fn lower(tokens: &[TokenKind]) -> Vec<Piece> {
    use TokenKind::{Dot, Ident, LBracket, LParen, RBracket, Str};

    let mut pieces = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if let [Ident(owner), Dot, Ident(name), LParen, ..] = &tokens[i..] {
            if let Some(builtin) = Builtin::lookup(owner, name) {
                pieces.push(Piece::Call(builtin.function_name()));
                i += 3;
                continue;
            }
        }

        let field = match &tokens[i..] {
            [Ident(body), Dot, Ident(fields), Dot, Ident(name), ..]
                if body == "body" && fields == "Fields" =>
            {
                Some((name, 5))
            }
            [Ident(body), Dot, Ident(fields), LBracket, Str(name), RBracket, ..]
                if body == "body" && fields == "Fields" =>
            {
                Some((name, 6))
            }
            [Ident(this), Dot, Ident(fields), LBracket, Str(name), RBracket, ..]
                if this == "self" && fields == "Fields" =>
            {
                Some((name, 6))
            }
            [Ident(this), LBracket, Str(name), RBracket, ..] if this == "self" => Some((name, 4)),
            _ => None,
        };
        match field {
            Some((name, used)) => {
                pieces.push(Piece::Field(internal_key(name)));
                i += used;
                if matches!(&tokens[i..], [Dot, Ident(value), ..] if value == "Value") {
                    i += 2;
                }
            }
            None => {
                pieces.push(Piece::Token(tokens[i].clone()));
                i += 1;
            }
        }
    }
    pieces
}

/// `(type)operand` becomes `CastType(operand)`. Rightmost casts go first, so
/// an operand is always free of casts by the time it is measured.
fn apply_casts(pieces: &mut Vec<Piece>) {
    let mut i = pieces.len();
    while i > 0 {
        i -= 1;
        let cast = match &pieces[i..] {
            [Piece::Token(TokenKind::LParen), Piece::Token(TokenKind::Ident(word)), Piece::Token(TokenKind::RParen), ..] => {
                CastType::from_keyword(word)
            }
            _ => None,
        };
        let Some(cast) = cast else {
            continue;
        };
        let Some(end) = operand_end(pieces, i + 3) else {
            continue;
        };
        pieces.insert(end, Piece::Token(TokenKind::RParen));
        pieces.splice(
            i..i + 3,
            [Piece::Call(cast.function_name()), Piece::Token(TokenKind::LParen)],
        );
    }
}

/// End (exclusive) of the unary operand starting at `start`: prefix `!`/`-`,
/// a primary, then any chain of `.member`, `.method(..)` and `[..]`.
fn operand_end(pieces: &[Piece], start: usize) -> Option<usize> {
    let mut j = start;
    while matches!(
        pieces.get(j),
        Some(Piece::Token(TokenKind::Not | TokenKind::Minus))
    ) {
        j += 1;
    }
    j = match pieces.get(j)? {
        Piece::Field(_) | Piece::Token(TokenKind::Str(_) | TokenKind::Number(_)) => j + 1,
        Piece::Token(TokenKind::Ident(_)) | Piece::Call(_) => match pieces.get(j + 1) {
            Some(Piece::Token(TokenKind::LParen)) => closing(pieces, j + 1)? + 1,
            _ => j + 1,
        },
        Piece::Token(TokenKind::LParen) => closing(pieces, j)? + 1,
        _ => return None,
    };
    loop {
        match (pieces.get(j), pieces.get(j + 1)) {
            (Some(Piece::Token(TokenKind::Dot)), Some(Piece::Token(TokenKind::Ident(_)))) => {
                j += 2;
                if let Some(Piece::Token(TokenKind::LParen)) = pieces.get(j) {
                    j = closing(pieces, j)? + 1;
                }
            }
            (Some(Piece::Token(TokenKind::LBracket)), _) => j = closing(pieces, j)? + 1,
            _ => return Some(j),
        }
    }
}

/// Index of the bracket closing the one at `open`.
fn closing(pieces: &[Piece], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (k, piece) in pieces.iter().enumerate().skip(open) {
        match piece {
            Piece::Token(TokenKind::LParen | TokenKind::LBracket) => depth += 1,
            Piece::Token(TokenKind::RParen | TokenKind::RBracket) => {
                depth -= 1;
                if depth == 0 {
                    return Some(k);
                }
            }
            _ => {}
        }
    }
    None
}

fn render(pieces: &[Piece]) -> String {
    let mut out = String::new();
    for piece in pieces {
        let text = match piece {
            Piece::Field(key) => format!("fields[{}]", quote(key)),
            Piece::Call(name) => (*name).to_string(),
            Piece::Token(token) => token_text(token),
        };
        let joins_word = out.ends_with(|c: char| c.is_alphanumeric() || c == '_')
            && text.starts_with(|c: char| c.is_alphanumeric() || c == '_');
        if joins_word {
            out.push(' ');
        }
        out.push_str(&text);
    }
    out
}

fn token_text(token: &TokenKind) -> String {
    let text = match token {
        TokenKind::Ident(word) if word == "null" => "()",
        TokenKind::Ident(word) => return word.clone(),
        TokenKind::Str(s) => return quote(s),
        TokenKind::Number(n) => return number_literal(*n),
        TokenKind::LParen => "(",
        TokenKind::RParen => ")",
        TokenKind::LBracket => "[",
        TokenKind::RBracket => "]",
        TokenKind::LBrace => "{",
        TokenKind::RBrace => "}",
        TokenKind::Dot => ".",
        TokenKind::Comma => ", ",
        TokenKind::Semicolon => ";",
        TokenKind::Question => " ? ",
        TokenKind::Colon => " : ",
        TokenKind::Not => "!",
        TokenKind::Plus => " + ",
        TokenKind::Minus => " - ",
        TokenKind::Star => " * ",
        TokenKind::Slash => " / ",
        TokenKind::Percent => " % ",
        TokenKind::Lt => " < ",
        TokenKind::Le => " <= ",
        TokenKind::Gt => " > ",
        TokenKind::Ge => " >= ",
        TokenKind::EqEq => " == ",
        TokenKind::NotEq => " != ",
        TokenKind::AndAnd => " && ",
        TokenKind::OrOr => " || ",
        TokenKind::Assign => " = ",
        TokenKind::Eof => "",
    };
    text.to_string()
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn number_literal(n: f64) -> String {
    let text = format_number(n);
    if n.fract() == 0.0 && n.abs() >= 1e15 && !text.contains('.') {
        format!("{text}.0")
    } else {
        text
    }
}

// ---------------------------------------------------------------------------
// Loose value semantics
// ---------------------------------------------------------------------------

/// Numbers, and strings that parse as numbers.
fn number_of(v: &Dynamic) -> Option<f64> {
    if let Ok(f) = v.as_float() {
        return Some(f);
    }
    if let Ok(i) = v.as_int() {
        return Some(i as f64);
    }
    if v.is_string() {
        return v.clone().into_immutable_string().ok()?.trim().parse().ok();
    }
    None
}

fn text_of(v: &Dynamic) -> String {
    if v.is_unit() {
        return String::new();
    }
    if let Ok(f) = v.as_float() {
        return format_number(f);
    }
    match v.clone().into_immutable_string() {
        Ok(s) => s.to_string(),
        Err(_) => v.to_string(),
    }
}

fn parse_number(v: &Dynamic) -> RhaiResultOf<FLOAT> {
    if v.is_unit() {
        return Err("cannot convert null to a number".into());
    }
    if let Ok(b) = v.as_bool() {
        return Ok(if b { 1.0 } else { 0.0 });
    }
    number_of(v).ok_or_else(|| format!("'{}' is not a number", text_of(v)).into())
}

/// `null` equals only `null`; numbers equal numeric strings; booleans equal
/// `"true"`/`"false"` in any case.
fn loose_eq(l: &Dynamic, r: &Dynamic) -> bool {
    if l.is_unit() || r.is_unit() {
        return l.is_unit() && r.is_unit();
    }
    match (l.as_bool(), r.as_bool()) {
        (Ok(a), Ok(b)) => return a == b,
        (Ok(b), Err(_)) | (Err(_), Ok(b)) => {
            let other = if l.as_bool().is_ok() { r } else { l };
            return text_of(other).eq_ignore_ascii_case(if b { "true" } else { "false" });
        }
        _ => {}
    }
    if l.is_string() && r.is_string() {
        return text_of(l) == text_of(r);
    }
    match (number_of(l), number_of(r)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn compare(l: &Dynamic, r: &Dynamic) -> Option<Ordering> {
    if l.is_string() && r.is_string() {
        return match (number_of(l), number_of(r)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => Some(text_of(l).cmp(&text_of(r))),
        };
    }
    number_of(l)?.partial_cmp(&number_of(r)?)
}

/// Orderings involving `null` are false; other incomparable pairs are errors.
fn ordered(l: &Dynamic, r: &Dynamic, accept: fn(Ordering) -> bool) -> RhaiResultOf<bool> {
    if l.is_unit() || r.is_unit() {
        return Ok(false);
    }
    compare(l, r)
        .map(accept)
        .ok_or_else(|| format!("cannot compare {} with {}", l.type_name(), r.type_name()).into())
}

macro_rules! loose_equality {
    ($engine:ident: $(($l:ty, $r:ty)),+ $(,)?) => {$(
        $engine
            .register_fn("==", |a: $l, b: $r| loose_eq(&Dynamic::from(a), &Dynamic::from(b)))
            .register_fn("!=", |a: $l, b: $r| !loose_eq(&Dynamic::from(a), &Dynamic::from(b)));
    )+};
}

macro_rules! loose_ordering {
    ($engine:ident: $(($l:ty, $r:ty)),+ $(,)?) => {$(
        $engine
            .register_fn("<", |a: $l, b: $r| ordered(&Dynamic::from(a), &Dynamic::from(b), Ordering::is_lt))
            .register_fn("<=", |a: $l, b: $r| ordered(&Dynamic::from(a), &Dynamic::from(b), Ordering::is_le))
            .register_fn(">", |a: $l, b: $r| ordered(&Dynamic::from(a), &Dynamic::from(b), Ordering::is_gt))
            .register_fn(">=", |a: $l, b: $r| ordered(&Dynamic::from(a), &Dynamic::from(b), Ordering::is_ge));
    )+};
}

fn register_comparisons(engine: &mut Engine) {
    type Str = ImmutableString;
    loose_equality!(engine:
        (Str, INT), (INT, Str), (Str, FLOAT), (FLOAT, Str), (Str, bool), (bool, Str),
        (bool, INT), (INT, bool), (bool, FLOAT), (FLOAT, bool),
        ((), INT), (INT, ()), ((), FLOAT), (FLOAT, ()), ((), Str), (Str, ()),
        ((), bool), (bool, ()), ((), ()),
    );
    loose_ordering!(engine:
        (Str, Str), (Str, INT), (INT, Str), (Str, FLOAT), (FLOAT, Str),
        ((), INT), (INT, ()), ((), FLOAT), (FLOAT, ()), ((), Str), (Str, ()), ((), ()),
    );
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

fn index_of(v: &Dynamic) -> RhaiResultOf<usize> {
    let n = parse_number(v)?;
    if n < 0.0 {
        return Err("negative index".into());
    }
    Ok(n as usize)
}

fn substring(s: &str, start: &Dynamic, len: Option<&Dynamic>) -> RhaiResultOf<String> {
    let chars: Vec<char> = s.chars().collect();
    let start = index_of(start)?;
    let len = match len {
        Some(l) => index_of(l)?,
        None => chars.len().saturating_sub(start),
    };
    match start.checked_add(len) {
        Some(end) if end <= chars.len() => Ok(chars[start..end].iter().collect()),
        _ => Err("Substring: range out of bounds".into()),
    }
}

fn round(v: &Dynamic, digits: i32) -> RhaiResultOf<FLOAT> {
    let scale = 10f64.powi(digits);
    Ok((parse_number(v)? * scale).round_ties_even() / scale)
}

fn register_helpers(engine: &mut Engine) {
    // Static calls, named by `Builtin::function_name`.
    engine
        .register_fn("IsNullOrEmpty", |v: Dynamic| {
            v.is_unit() || (v.is_string() && text_of(&v).is_empty())
        })
        .register_fn("IsNullOrWhiteSpace", |v: Dynamic| {
            v.is_unit() || (v.is_string() && text_of(&v).trim().is_empty())
        })
        .register_fn("ToDouble", |v: Dynamic| -> RhaiResultOf<FLOAT> {
            if v.is_unit() {
                return Ok(0.0);
            }
            parse_number(&v)
        })
        .register_fn("ToInt", |v: Dynamic| -> RhaiResultOf<INT> {
            if v.is_unit() {
                return Ok(0);
            }
            Ok(parse_number(&v)?.round_ties_even() as INT)
        })
        .register_fn("ToStr", |v: Dynamic| text_of(&v))
        .register_fn("Round", |v: Dynamic| round(&v, 0))
        .register_fn("Round", |v: Dynamic, digits: Dynamic| -> RhaiResultOf<FLOAT> {
            round(&v, parse_number(&digits)? as i32)
        })
        .register_fn("Abs", |v: Dynamic| parse_number(&v).map(FLOAT::abs))
        .register_fn("Max", |a: Dynamic, b: Dynamic| -> RhaiResultOf<FLOAT> {
            Ok(parse_number(&a)?.max(parse_number(&b)?))
        })
        .register_fn("Min", |a: Dynamic, b: Dynamic| -> RhaiResultOf<FLOAT> {
            Ok(parse_number(&a)?.min(parse_number(&b)?))
        });

    // Casts, named by `CastType::function_name`.
    engine
        .register_fn("CastString", |v: Dynamic| {
            if v.is_unit() {
                Dynamic::UNIT
            } else {
                Dynamic::from(ImmutableString::from(text_of(&v)))
            }
        })
        .register_fn("CastDouble", |v: Dynamic| parse_number(&v))
        .register_fn("CastInt", |v: Dynamic| -> RhaiResultOf<INT> {
            Ok(parse_number(&v)?.trunc() as INT)
        })
        .register_fn("CastBool", |v: Dynamic| -> RhaiResultOf<bool> {
            if let Ok(b) = v.as_bool() {
                return Ok(b);
            }
            match text_of(&v).to_ascii_lowercase().as_str() {
                "true" if v.is_string() => Ok(true),
                "false" if v.is_string() => Ok(false),
                _ => Err(format!("cannot convert {} to bool", v.type_name()).into()),
            }
        });

    // String members.
    engine
        .register_fn("Contains", |s: &mut ImmutableString, x: Dynamic| {
            s.contains(text_of(&x).as_str())
        })
        .register_fn("StartsWith", |s: &mut ImmutableString, x: Dynamic| {
            s.starts_with(text_of(&x).as_str())
        })
        .register_fn("EndsWith", |s: &mut ImmutableString, x: Dynamic| {
            s.ends_with(text_of(&x).as_str())
        })
        .register_fn("Equals", |s: &mut ImmutableString, x: Dynamic| {
            s.as_str() == text_of(&x)
        })
        .register_fn("ToLower", |s: &mut ImmutableString| s.to_lowercase())
        .register_fn("ToLowerInvariant", |s: &mut ImmutableString| s.to_lowercase())
        .register_fn("ToUpper", |s: &mut ImmutableString| s.to_uppercase())
        .register_fn("ToUpperInvariant", |s: &mut ImmutableString| s.to_uppercase())
        .register_fn("Trim", |s: &mut ImmutableString| s.trim().to_string())
        .register_fn("Replace", |s: &mut ImmutableString, from: Dynamic, to: Dynamic| {
            s.replace(text_of(&from).as_str(), &text_of(&to))
        })
        .register_fn("Substring", |s: &mut ImmutableString, start: Dynamic| {
            substring(s.as_str(), &start, None)
        })
        .register_fn(
            "Substring",
            |s: &mut ImmutableString, start: Dynamic, len: Dynamic| {
                substring(s.as_str(), &start, Some(&len))
            },
        )
        .register_fn("Split", |s: &mut ImmutableString, sep: Dynamic| -> Array {
            let sep = text_of(&sep);
            if sep.is_empty() {
                return vec![Dynamic::from(s.clone())];
            }
            s.split(sep.as_str())
                .map(|part| Dynamic::from(ImmutableString::from(part)))
                .collect()
        })
        .register_fn("ToString", |v: Dynamic| text_of(&v))
        .register_get("Length", |s: &mut ImmutableString| s.chars().count() as INT)
        .register_get("Length", |a: &mut Array| a.len() as INT)
        .register_get("Count", |a: &mut Array| a.len() as INT);
}

// ---------------------------------------------------------------------------
// Static analysis
// ---------------------------------------------------------------------------

static FIELD_REF_RE: OnceLock<Regex> = OnceLock::new();
static SELF_REF_RE: OnceLock<Regex> = OnceLock::new();

/// Internal keys of the fields an expression mentions as `body.Fields.<Name>`
/// or `self["Name"]`.
///
/// A textual scan: it can report names inside string literals. Callers use
/// it only to pre-populate missing fields with `null` and to describe rules.
pub fn referenced_fields(expression: &str) -> BTreeSet<String> {
    let body = FIELD_REF_RE
        .get_or_init(|| Regex::new(r"body\.Fields\.([A-Za-z_][A-Za-z0-9_]*)").unwrap());
    let this = SELF_REF_RE.get_or_init(|| {
        Regex::new(r#"self(?:\.Fields)?\s*\[\s*"([^"]+)"\s*\]"#).unwrap()
    });
    body.captures_iter(expression)
        .chain(this.captures_iter(expression))
        .map(|c| internal_key(&c[1]))
        .collect()
}

/// Outcome of checking an expression without running it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionCheck {
    pub expression: String,
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub referenced_fields: Vec<String>,
    pub suggestions: Vec<String>,
}

const MAX_CONJUNCTS: usize = 4;

/// Compile `expression` and collect authoring hints.
pub fn check_expression(engine: &dyn ExpressionEngine, expression: &str) -> ExpressionCheck {
    let error = engine.validate(expression).err().map(|e| e.to_string());
    let mut suggestions = Vec::new();
    if expression.contains("== null") || expression.contains("!= null") {
        suggestions.push(
            "string.IsNullOrWhiteSpace(..) also catches empty and blank values".to_string(),
        );
    }
    if expression.split("&&").count() > MAX_CONJUNCTS {
        suggestions.push(format!(
            "more than {MAX_CONJUNCTS} conditions joined with &&; consider splitting the rule"
        ));
    }
    ExpressionCheck {
        expression: expression.to_string(),
        is_valid: error.is_none(),
        error,
        referenced_fields: referenced_fields(expression).into_iter().collect(),
        suggestions,
    }
}
