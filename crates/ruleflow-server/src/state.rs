use ruleflow_core::client::WorkItemClient;
use ruleflow_core::config::Config;
use ruleflow_core::guard::{EventThrottle, ExecutionGuard};
use ruleflow_core::orchestrator::RuleOrchestrator;
use ruleflow_core::session::{FanoutSink, JsonlSessionSink, SessionSink, TracingSessionSink};
use ruleflow_core::store::{RuleStore, YamlRuleStore};
use std::path::PathBuf;
use std::sync::Arc;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub config: Arc<Config>,
    pub store: Arc<dyn RuleStore>,
    pub guard: Arc<ExecutionGuard>,
    pub throttle: Arc<EventThrottle>,
    pub orchestrator: Arc<RuleOrchestrator>,
}

impl AppState {
    /// Wire the YAML rule store under `root`, the guard, the event throttle
    /// and the session sinks around `client`.
    pub fn new(
        root: PathBuf,
        config: Config,
        client: Arc<dyn WorkItemClient>,
    ) -> ruleflow_core::Result<Self> {
        let store: Arc<dyn RuleStore> = Arc::new(YamlRuleStore::new(config.rules_dir(&root)));
        let guard = Arc::new(ExecutionGuard::new(config.guard.clone()));
        let throttle = Arc::new(EventThrottle::new(
            config.events.min_interval_secs,
            config.events.max_entries,
        ));

        let mut sinks: Vec<Arc<dyn SessionSink>> = vec![Arc::new(TracingSessionSink)];
        if let Some(dir) = config.sessions_dir(&root) {
            sinks.push(Arc::new(JsonlSessionSink::new(dir)));
        }

        let orchestrator = RuleOrchestrator::new(store.clone(), client, guard.clone())?
            .with_sink(Arc::new(FanoutSink(sinks)))
            .with_throttle(throttle.clone());

        Ok(Self {
            root,
            config: Arc::new(config),
            store,
            guard,
            throttle,
            orchestrator: Arc::new(orchestrator),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruleflow_core::client::RecordingClient;

    #[test]
    fn new_state_stores_root() {
        let state = AppState::new(
            PathBuf::from("/tmp/ruleflow-test"),
            Config::default(),
            Arc::new(RecordingClient::new()),
        )
        .unwrap();
        assert_eq!(state.root, PathBuf::from("/tmp/ruleflow-test"));
        assert!(state.throttle.is_empty());
    }
}
