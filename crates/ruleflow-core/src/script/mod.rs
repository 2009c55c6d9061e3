//! Script rules: legacy snippets run through a small, safe statement
//! language.
//!
//! Source is tokenized, parsed into an [`ast::Stmt`] tree and interpreted
//! against a [`FieldAccessor`]. Nothing in here can reach the host: the only
//! effects a script can have are field writes collected by the executor.

pub(crate) mod ast;
mod eval;
pub(crate) mod lexer;
mod parser;

use crate::accessor::FieldAccessor;
use crate::client::WorkItemClient;
use crate::context::WorkItemContext;
use crate::error::{Result, RuleflowError};
use ast::{Expr, Stmt};
use eval::{eval, Scope, Value};
use parser::parse_program;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScriptOutcome {
    pub success: bool,
    pub changes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScriptOutcome {
    fn failed(message: String) -> Self {
        Self {
            success: false,
            changes: BTreeMap::new(),
            error: Some(message),
        }
    }
}

/// Runs script-rule snippets against a [`FieldAccessor`].
///
/// Snippets are parsed into the safe statement language; nothing is compiled
/// or loaded. Writes are buffered and pushed as one batch after the program
/// completes, so a failing script never leaves partial writes behind.
pub struct ScriptExecutor {
    client: Arc<dyn WorkItemClient>,
}

impl ScriptExecutor {
    pub fn new(client: Arc<dyn WorkItemClient>) -> Self {
        Self { client }
    }

    /// Parse without running; used to reject bad snippets on import.
    pub fn compile(name: &str, source: &str) -> Result<Vec<Stmt>> {
        parse_program(source).map_err(|e| RuleflowError::Script {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    pub async fn run(&self, name: &str, source: &str, ctx: &mut WorkItemContext) -> ScriptOutcome {
        let program = match Self::compile(name, source) {
            Ok(p) => p,
            Err(e) => {
                error!(work_item = ctx.id, rule = %name, "script compile failed: {e}");
                return ScriptOutcome::failed(e.to_string());
            }
        };

        let mut accessor = FieldAccessor::new(ctx);
        if let Err(e) = interpret(&program, &mut accessor) {
            let e = RuleflowError::Script {
                name: name.to_string(),
                message: e.to_string(),
            };
            error!(work_item = ctx.id, rule = %name, "script failed: {e}");
            return ScriptOutcome::failed(e.to_string());
        }

        let changes = accessor.changes().clone();
        if !changes.is_empty() {
            let project = ctx.project();
            if let Err(e) = self.client.update_fields(ctx.id, &changes, &project).await {
                error!(work_item = ctx.id, rule = %name, "script field update failed: {e}");
                return ScriptOutcome::failed(e.to_string());
            }
        }

        info!(
            work_item = ctx.id,
            rule = %name,
            changes = changes.len(),
            "script completed"
        );
        accessor.commit(ctx);
        ScriptOutcome {
            success: true,
            changes,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Return,
}

struct ScriptScope<'a> {
    accessor: &'a FieldAccessor,
    locals: &'a HashMap<String, Value>,
}

impl Scope for ScriptScope<'_> {
    fn field(&self, name: &str) -> Value {
        Value::Str(self.accessor.get(name))
    }

    fn var(&self, name: &str) -> Option<Value> {
        self.locals.get(name).cloned()
    }
}

fn interpret(program: &[Stmt], accessor: &mut FieldAccessor) -> Result<()> {
    let mut locals = HashMap::new();
    exec_block(program, accessor, &mut locals)?;
    Ok(())
}

fn exec_block(
    stmts: &[Stmt],
    accessor: &mut FieldAccessor,
    locals: &mut HashMap<String, Value>,
) -> Result<Flow> {
    for stmt in stmts {
        if let Flow::Return = exec(stmt, accessor, locals)? {
            return Ok(Flow::Return);
        }
    }
    Ok(Flow::Continue)
}

fn value_of(expr: &Expr, accessor: &FieldAccessor, locals: &HashMap<String, Value>) -> Result<Value> {
    eval(expr, &ScriptScope { accessor, locals })
}

fn exec(
    stmt: &Stmt,
    accessor: &mut FieldAccessor,
    locals: &mut HashMap<String, Value>,
) -> Result<Flow> {
    match stmt {
        Stmt::SetField { field, value } => {
            let v = value_of(value, accessor, locals)?;
            accessor.set(field, v.to_string());
        }
        Stmt::Declare { name, value } => {
            let v = value_of(value, accessor, locals)?;
            locals.insert(name.clone(), v);
        }
        Stmt::Assign { name, value } => {
            if !locals.contains_key(name) {
                return Err(RuleflowError::evaluation(format!(
                    "assignment to undeclared variable '{name}'"
                )));
            }
            let v = value_of(value, accessor, locals)?;
            locals.insert(name.clone(), v);
        }
        Stmt::If {
            condition,
            then_branch,
            else_branch,
        } => {
            let branch = if value_of(condition, accessor, locals)?.as_bool()? {
                then_branch
            } else {
                else_branch
            };
            return exec_block(branch, accessor, locals);
        }
        Stmt::Return => return Ok(Flow::Return),
    }
    Ok(Flow::Continue)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
