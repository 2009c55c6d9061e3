use super::ast::{BinaryOp, Builtin, CastType, Expr, Literal, UnaryOp};
use crate::context::format_number;
use crate::error::{Result, RuleflowError};
use std::cmp::Ordering;
use std::fmt;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    List(Vec<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "list",
        }
    }

    /// Numeric view used by arithmetic and comparisons: numbers, and
    /// strings that parse as numbers.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(RuleflowError::evaluation(format!(
                "expected bool, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => f.write_str(&items.join(",")),
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Name resolution for an evaluation: work-item fields and script locals.
pub trait Scope {
    fn field(&self, name: &str) -> Value;

    fn var(&self, _name: &str) -> Option<Value> {
        None
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn fail<T>(message: impl Into<String>) -> Result<T> {
    Err(RuleflowError::evaluation(message))
}

pub fn eval(expr: &Expr, scope: &dyn Scope) -> Result<Value> {
    match expr {
        Expr::Literal(lit) => Ok(match lit {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Number(n) => Value::Number(*n),
            Literal::Str(s) => Value::Str(s.clone()),
        }),
        Expr::Field(name) => Ok(scope.field(name)),
        Expr::Var(name) => match scope.var(name) {
            Some(v) => Ok(v),
            None => fail(format!("unknown identifier '{name}'")),
        },
        Expr::Unary(op, inner) => {
            let v = eval(inner, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!v.as_bool()?)),
                UnaryOp::Neg => match v.as_number() {
                    Some(n) => Ok(Value::Number(-n)),
                    None => fail(format!("cannot negate {}", v.type_name())),
                },
            }
        }
        Expr::Binary(BinaryOp::And, left, right) => {
            if !eval(left, scope)?.as_bool()? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(right, scope)?.as_bool()?))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if eval(left, scope)?.as_bool()? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(right, scope)?.as_bool()?))
        }
        Expr::Binary(op, left, right) => {
            let l = eval(left, scope)?;
            let r = eval(right, scope)?;
            binary(*op, l, r)
        }
        Expr::Cast(ty, inner) => cast(*ty, eval(inner, scope)?),
        Expr::Call(builtin, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, scope))
                .collect::<Result<Vec<_>>>()?;
            call(*builtin, values)
        }
        Expr::Method { target, name, args } => {
            let target = eval(target, scope)?;
            let values = args
                .iter()
                .map(|a| eval(a, scope))
                .collect::<Result<Vec<_>>>()?;
            method(target, name, values)
        }
        Expr::Property { target, name } => property(eval(target, scope)?, name),
        Expr::Index { target, index } => {
            let target = eval(target, scope)?;
            let index = eval(index, scope)?
                .as_number()
                .ok_or_else(|| RuleflowError::evaluation("index must be a number"))?;
            index_into(target, index)
        }
    }
}

/// Loose equality: numbers compare numerically against numeric strings,
/// `null` equals only `null`.
fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Number(_), Value::Str(_)) | (Value::Str(_), Value::Number(_)) => {
            match (l.as_number(), r.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Bool(b), Value::Str(s)) | (Value::Str(s), Value::Bool(b)) => {
            s.eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => a == b,
        _ => false,
    }
}

fn compare(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Str(a), Value::Str(b)) => match (l.as_number(), r.as_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => Some(a.cmp(b)),
        },
        _ => match (l.as_number(), r.as_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
        BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(&l, &r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            // Comparisons involving null are false.
            let Some(ord) = compare(&l, &r) else {
                if l.is_null() || r.is_null() {
                    return Ok(Value::Bool(false));
                }
                return fail(format!(
                    "cannot compare {} with {}",
                    l.type_name(),
                    r.type_name()
                ));
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::Add => match (&l, &r) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::Str(_), _) | (_, Value::Str(_)) => Ok(Value::Str(format!("{l}{r}"))),
            _ => fail(format!("cannot add {} and {}", l.type_name(), r.type_name())),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (Some(a), Some(b)) = (l.as_number(), r.as_number()) else {
                return fail(format!(
                    "arithmetic on {} and {}",
                    l.type_name(),
                    r.type_name()
                ));
            };
            if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0.0 {
                return fail("division by zero");
            }
            Ok(Value::Number(match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            }))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators handled in eval"),
    }
}

fn parse_number(v: &Value) -> Result<f64> {
    match v {
        Value::Number(n) => Ok(*n),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| RuleflowError::evaluation(format!("'{s}' is not a number"))),
        other => fail(format!("cannot convert {} to a number", other.type_name())),
    }
}

fn cast(ty: CastType, v: Value) -> Result<Value> {
    match ty {
        CastType::String => Ok(match v {
            Value::Null => Value::Null,
            other => Value::Str(other.to_string()),
        }),
        CastType::Double => Ok(Value::Number(parse_number(&v)?)),
        CastType::Int => Ok(Value::Number(parse_number(&v)?.trunc())),
        CastType::Bool => match &v {
            Value::Bool(_) => Ok(v),
            Value::Str(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Value::Str(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            other => fail(format!("cannot convert {} to bool", other.type_name())),
        },
    }
}

fn arg<'a>(args: &'a [Value], idx: usize, func: &str) -> Result<&'a Value> {
    args.get(idx)
        .ok_or_else(|| RuleflowError::evaluation(format!("{func}: missing argument {}", idx + 1)))
}

fn call(builtin: Builtin, args: Vec<Value>) -> Result<Value> {
    match builtin {
        Builtin::IsNullOrEmpty => {
            let v = arg(&args, 0, "IsNullOrEmpty")?;
            Ok(Value::Bool(match v {
                Value::Null => true,
                Value::Str(s) => s.is_empty(),
                _ => false,
            }))
        }
        Builtin::IsNullOrWhiteSpace => {
            let v = arg(&args, 0, "IsNullOrWhiteSpace")?;
            Ok(Value::Bool(match v {
                Value::Null => true,
                Value::Str(s) => s.trim().is_empty(),
                _ => false,
            }))
        }
        Builtin::ToDouble => match arg(&args, 0, "ToDouble")? {
            Value::Null => Ok(Value::Number(0.0)),
            v => Ok(Value::Number(parse_number(v)?)),
        },
        Builtin::ToInt => match arg(&args, 0, "ToInt32")? {
            Value::Null => Ok(Value::Number(0.0)),
            v => Ok(Value::Number(parse_number(v)?.round_ties_even())),
        },
        Builtin::ToStr => Ok(Value::Str(arg(&args, 0, "ToString")?.to_string())),
        Builtin::Round => {
            let n = parse_number(arg(&args, 0, "Round")?)?;
            let digits = match args.get(1) {
                Some(d) => parse_number(d)? as i32,
                None => 0,
            };
            let scale = 10f64.powi(digits);
            Ok(Value::Number((n * scale).round_ties_even() / scale))
        }
        Builtin::Abs => Ok(Value::Number(parse_number(arg(&args, 0, "Abs")?)?.abs())),
        Builtin::Max | Builtin::Min => {
            let a = parse_number(arg(&args, 0, "Max/Min")?)?;
            let b = parse_number(arg(&args, 1, "Max/Min")?)?;
            Ok(Value::Number(if builtin == Builtin::Max {
                a.max(b)
            } else {
                a.min(b)
            }))
        }
    }
}

fn string_arg(args: &[Value], idx: usize, func: &str) -> Result<String> {
    Ok(arg(args, idx, func)?.to_string())
}

fn method(target: Value, name: &str, args: Vec<Value>) -> Result<Value> {
    if name == "ToString" {
        return Ok(Value::Str(target.to_string()));
    }
    let s = match target {
        Value::Str(s) => s,
        Value::Null => return fail(format!("null reference calling {name}")),
        other => return fail(format!("{} has no method {name}", other.type_name())),
    };
    match name {
        "Contains" => Ok(Value::Bool(s.contains(&string_arg(&args, 0, name)?))),
        "StartsWith" => Ok(Value::Bool(s.starts_with(&string_arg(&args, 0, name)?))),
        "EndsWith" => Ok(Value::Bool(s.ends_with(&string_arg(&args, 0, name)?))),
        "Equals" => Ok(Value::Bool(s == string_arg(&args, 0, name)?)),
        "ToLower" | "ToLowerInvariant" => Ok(Value::Str(s.to_lowercase())),
        "ToUpper" | "ToUpperInvariant" => Ok(Value::Str(s.to_uppercase())),
        "Trim" => Ok(Value::Str(s.trim().to_string())),
        "Replace" => Ok(Value::Str(
            s.replace(&string_arg(&args, 0, name)?, &string_arg(&args, 1, name)?),
        )),
        "Substring" => {
            let chars: Vec<char> = s.chars().collect();
            let start = parse_number(arg(&args, 0, name)?)? as usize;
            let len = match args.get(1) {
                Some(l) => parse_number(l)? as usize,
                None => chars.len().saturating_sub(start),
            };
            match start.checked_add(len) {
                Some(end) if end <= chars.len() => Ok(Value::Str(chars[start..end].iter().collect())),
                _ => fail("Substring: range out of bounds"),
            }
        }
        "Split" => {
            let sep = string_arg(&args, 0, name)?;
            if sep.is_empty() {
                return Ok(Value::List(vec![s]));
            }
            Ok(Value::List(s.split(sep.as_str()).map(str::to_string).collect()))
        }
        _ => fail(format!("unsupported method '{name}'")),
    }
}

fn property(target: Value, name: &str) -> Result<Value> {
    match (name, &target) {
        ("Length", Value::Str(s)) => Ok(Value::Number(s.chars().count() as f64)),
        ("Length" | "Count", Value::List(items)) => Ok(Value::Number(items.len() as f64)),
        ("Value", _) => Ok(target),
        _ => fail(format!("unsupported member '{name}' on {}", target.type_name())),
    }
}

fn index_into(target: Value, index: f64) -> Result<Value> {
    if index < 0.0 {
        return fail("negative index");
    }
    let idx = index as usize;
    match target {
        Value::List(items) => items
            .get(idx)
            .map(|s| Value::Str(s.clone()))
            .ok_or_else(|| RuleflowError::evaluation("index out of range")),
        Value::Str(s) => s
            .chars()
            .nth(idx)
            .map(|c| Value::Str(c.to_string()))
            .ok_or_else(|| RuleflowError::evaluation("index out of range")),
        other => fail(format!("cannot index {}", other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::parse_expression;
    use std::collections::HashMap;

    struct MapScope(HashMap<&'static str, Value>);

    impl Scope for MapScope {
        fn field(&self, name: &str) -> Value {
            self.0.get(name).cloned().unwrap_or(Value::Null)
        }
    }

    fn eval_str(src: &str) -> Result<Value> {
        let scope = MapScope(HashMap::from([
            ("State", Value::Str("Active".into())),
            ("Effort", Value::Number(13.0)),
            ("EffortText", Value::Str("40".into())),
            ("Owner", Value::Str("Dana <dana@example.com>".into())),
        ]));
        eval(&parse_expression(src)?, &scope)
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!(eval_str("self[\"State\"] == \"Active\"").unwrap(), Value::Bool(true));
        assert_eq!(
            eval_str("self[\"Effort\"] > 10 && self[\"Effort\"] <= 13").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(eval_str("self[\"EffortText\"] >= 40").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("!(1 == 2) || x").unwrap(), Value::Bool(true));
    }

    #[test]
    fn null_semantics() {
        assert_eq!(eval_str("self[\"Missing\"] == null").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("self[\"Missing\"] != 0").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("self[\"Missing\"] > 3").unwrap(), Value::Bool(false));
        assert_eq!(
            eval_str("string.IsNullOrWhiteSpace(self[\"Missing\"])").unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn string_methods() {
        assert_eq!(
            eval_str("self[\"Owner\"].Split('<')[0].Trim()").unwrap(),
            Value::Str("Dana".into())
        );
        assert_eq!(
            eval_str("self[\"State\"].ToLower().Contains(\"act\")").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_str("\"n=\" + self[\"Effort\"]").unwrap(),
            Value::Str("n=13".into())
        );
    }

    #[test]
    fn substring_bounds() {
        assert_eq!(
            eval_str("self[\"State\"].Substring(1, 3)").unwrap(),
            Value::Str("cti".into())
        );
        assert_eq!(eval_str("self[\"State\"].Substring(4)").unwrap(), Value::Str("ve".into()));
        assert!(eval_str("self[\"State\"].Substring(5, 2)").is_err());
        assert!(eval_str("self[\"State\"].Substring(2, 18446744073709551615)").is_err());
    }

    #[test]
    fn casts_and_arithmetic() {
        assert_eq!(eval_str("(double)\"2.5\" * 2").unwrap(), Value::Number(5.0));
        assert_eq!(eval_str("(int)7.9").unwrap(), Value::Number(7.0));
        assert!(eval_str("(double)\"abc\"").is_err());
        assert!(eval_str("1 / 0").is_err());
        assert_eq!(eval_str("Math.Round(2.5)").unwrap(), Value::Number(2.0));
    }

    #[test]
    fn non_bool_condition_is_an_error() {
        assert!(eval_str("self[\"State\"] && true").is_err());
        assert!(eval_str("unknownVar == 1").is_err());
    }
}
