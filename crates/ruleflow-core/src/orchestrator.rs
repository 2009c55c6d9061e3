//! Per-event rule execution: fetch, filter, guard, evaluate, dispatch, record.

use crate::actions::ActionDispatcher;
use crate::client::WorkItemClient;
use crate::context::{WorkItemContext, WorkItemEvent};
use crate::engine::{referenced_fields, DefaultExpressionEngine, ExpressionEngine};
use crate::error::Result;
use crate::guard::{fields_hash, Admission, EventThrottle, ExecutionGuard};
use crate::rule::{ConditionType, RuleDefinition};
use crate::script::ScriptExecutor;
use crate::session::{
    ActionStatus, ExecutionSession, RuleExecutionResult, RuleStatus, SessionSink,
    TracingSessionSink,
};
use crate::store::RuleStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Result of handling one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Accepted(ExecutionSession),
    RateLimited { work_item_id: i64 },
}

pub struct RuleOrchestrator {
    store: Arc<dyn RuleStore>,
    engine: Arc<dyn ExpressionEngine>,
    guard: Arc<ExecutionGuard>,
    dispatcher: Arc<ActionDispatcher>,
    sink: Arc<dyn SessionSink>,
    throttle: Option<Arc<EventThrottle>>,
}

impl RuleOrchestrator {
    /// Orchestrator with the built-in engine, every built-in action handler
    /// writing through `client`, and a tracing session sink.
    pub fn new(
        store: Arc<dyn RuleStore>,
        client: Arc<dyn WorkItemClient>,
        guard: Arc<ExecutionGuard>,
    ) -> Result<Self> {
        let scripts = Arc::new(ScriptExecutor::new(client.clone()));
        let dispatcher = ActionDispatcher::with_builtins(client, scripts)?;
        Ok(Self {
            store,
            engine: Arc::new(DefaultExpressionEngine::new()),
            guard,
            dispatcher: Arc::new(dispatcher),
            sink: Arc::new(TracingSessionSink),
            throttle: None,
        })
    }

    pub fn with_engine(mut self, engine: Arc<dyn ExpressionEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<ActionDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn SessionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_throttle(mut self, throttle: Arc<EventThrottle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn guard(&self) -> &Arc<ExecutionGuard> {
        &self.guard
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<dyn ExpressionEngine> {
        &self.engine
    }

    /// Validate, throttle and execute one webhook event.
    pub async fn process_event(&self, event: &WorkItemEvent) -> Result<EventOutcome> {
        let mut ctx = WorkItemContext::from_event(event)?;
        if let Some(throttle) = &self.throttle {
            if !throttle.admit(ctx.id) {
                return Ok(EventOutcome::RateLimited {
                    work_item_id: ctx.id,
                });
            }
        }
        let session = self.execute_rules(&mut ctx).await?;
        Ok(EventOutcome::Accepted(session))
    }

    /// Run every active rule of the work item's project against `ctx`.
    ///
    /// Only a rule store failure is returned as an error. Evaluation and
    /// action failures are recorded in the session. Accepted writes are
    /// applied to `ctx`, so later rules see earlier rules' changes.
    pub async fn execute_rules(&self, ctx: &mut WorkItemContext) -> Result<ExecutionSession> {
        let project = ctx.project();
        let work_item_type = ctx.work_item_type();
        let rules = self.store.active_rules(&project).await?;

        let mut session = ExecutionSession::start(ctx);
        // Duplicate detection compares the fields as they arrived.
        let hash = fields_hash(ctx);

        let (script_rules, expression_rules): (Vec<RuleDefinition>, Vec<RuleDefinition>) =
            rules.into_iter().partition(RuleDefinition::is_script_rule);

        let referenced: BTreeSet<String> = expression_rules
            .iter()
            .flat_map(|r| referenced_fields(&r.expression))
            .collect();
        ctx.ensure_fields(&referenced);

        info!(
            work_item = ctx.id,
            project = %project,
            work_item_type = %work_item_type,
            expression_rules = expression_rules.len(),
            script_rules = script_rules.len(),
            "executing rules"
        );

        for rule in expression_rules
            .iter()
            .filter(|r| r.applies_to_type(&work_item_type))
        {
            let result = self.run_expression_rule(rule, ctx, &hash).await;
            session.push(result);
        }

        for rule in script_rules
            .iter()
            .filter(|r| r.applies_to_type(&work_item_type))
        {
            let result = self.run_script_rule(rule, ctx).await;
            session.push(result);
        }

        session.finish();
        self.sink.record(&session);
        Ok(session)
    }

    async fn run_expression_rule(
        &self,
        rule: &RuleDefinition,
        ctx: &mut WorkItemContext,
        hash: &str,
    ) -> RuleExecutionResult {
        let started = Instant::now();

        if let Admission::Blocked(reason) = self.guard.try_admit(&rule.name, ctx.id, hash) {
            return RuleExecutionResult::new(rule, RuleStatus::Skipped)
                .with_error(reason.describe());
        }

        let (mut result, condition) = match self.engine.evaluate(&rule.expression, ctx) {
            Ok(true) => (
                RuleExecutionResult::new(rule, RuleStatus::Passed),
                ConditionType::Success,
            ),
            Ok(false) => (
                RuleExecutionResult::new(rule, RuleStatus::Failed),
                ConditionType::Failure,
            ),
            Err(e) => (
                RuleExecutionResult::new(rule, RuleStatus::Failed).with_error(e.to_string()),
                ConditionType::Failure,
            ),
        };
        info!(
            work_item = ctx.id,
            rule = %rule.name,
            status = ?result.status,
            "rule evaluated"
        );

        let actions = rule.actions_for(condition);
        if !actions.is_empty() {
            let report = self.dispatcher.execute(&actions, ctx).await;
            result.actions = report.records;
            result.field_changes = report.field_changes;
        }

        if result.status == RuleStatus::Passed {
            self.guard.record(&rule.name, ctx.id, hash);
        } else {
            self.guard.release(&rule.name, ctx.id);
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn run_script_rule(
        &self,
        rule: &RuleDefinition,
        ctx: &mut WorkItemContext,
    ) -> RuleExecutionResult {
        let started = Instant::now();
        let Some(action) = rule.script_action() else {
            return RuleExecutionResult::new(rule, RuleStatus::Failed)
                .with_error("script rule has no script action");
        };

        debug!(work_item = ctx.id, rule = %rule.name, "running script rule");
        let report = self.dispatcher.execute(&[action], ctx).await;
        let failure = report
            .records
            .iter()
            .find(|r| r.status != ActionStatus::Success)
            .map(|r| {
                r.error_message
                    .clone()
                    .unwrap_or_else(|| "script did not run".to_string())
            });

        let mut result = match failure {
            None => RuleExecutionResult::new(rule, RuleStatus::Passed),
            Some(message) => RuleExecutionResult::new(rule, RuleStatus::Failed).with_error(message),
        };
        info!(
            work_item = ctx.id,
            rule = %rule.name,
            status = ?result.status,
            "script rule finished"
        );
        result.actions = report.records;
        result.field_changes = report.field_changes;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }
}
