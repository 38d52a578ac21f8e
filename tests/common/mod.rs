#![allow(dead_code)]

use async_trait::async_trait;
use axum::{Form, Router, extract::State, routing::post};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use probe_agent::agent_modules::checklist::Checklist;
use probe_agent::agent_modules::config::AgentConfig;
use probe_agent::agent_modules::context::AgentContext;
use probe_agent::agent_modules::job::{CheckJob, CheckResult, now_ms};
use probe_agent::agent_modules::publisher::{PublisherSettings, ResultPublisher};
use probe_agent::agent_modules::registry::{Checker, CheckerRegistry};
use probe_agent::agent_modules::store::ChecklistStore;

/// Stand-in for the control plane: records every form post and answers
/// with a fixed body, optionally after a delay.
#[derive(Clone)]
pub struct Collector {
    posts: Arc<Mutex<Vec<HashMap<String, String>>>>,
    body: Arc<String>,
    delay: Duration,
}

impl Collector {
    pub fn posts(&self) -> Vec<HashMap<String, String>> {
        self.posts.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.posts.lock().unwrap().len()
    }
}

async fn collect(
    State(collector): State<Collector>,
    Form(form): Form<HashMap<String, String>>,
) -> String {
    collector.posts.lock().unwrap().push(form);
    if !collector.delay.is_zero() {
        tokio::time::sleep(collector.delay).await;
    }
    collector.body.to_string()
}

pub async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Starts a collector answering both agent endpoints. Returns its base URL.
pub async fn spawn_collector(body: &str, delay: Duration) -> (String, Collector) {
    let collector = Collector {
        posts: Arc::new(Mutex::new(Vec::new())),
        body: Arc::new(body.to_string()),
        delay,
    };
    let app = Router::new()
        .route("/agent/results", post(collect))
        .route("/agent/heartbeat", post(collect))
        .with_state(collector.clone());
    let addr = serve(app).await;
    (format!("http://{addr}/"), collector)
}

/// Base URL of a port nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/")
}

pub fn test_config(api_url: &str, data_dir: &Path) -> AgentConfig {
    let raw = format!(
        "check_id = \"agent-1\"\n\
         check_token = \"token-1\"\n\
         api_url = \"{api_url}\"\n\
         heartbeat_offset_secs = 5\n\
         data_dir = '{}'\n",
        data_dir.display()
    );
    toml::from_str(&raw).unwrap()
}

pub fn fast_publisher() -> PublisherSettings {
    PublisherSettings {
        max_attempts: 3,
        backoff_step: Duration::from_millis(5),
        connect_timeout: Duration::from_millis(500),
        request_deadline: Duration::from_secs(2),
    }
}

pub fn test_context(
    config: AgentConfig,
    registry: CheckerRegistry,
    checklist: Checklist,
) -> Arc<AgentContext> {
    let store = Arc::new(ChecklistStore::new(config.checklist_path(), checklist));
    let publisher = ResultPublisher::new(
        config.results_url(),
        config.check_id.clone(),
        config.check_token.clone(),
        fast_publisher(),
    )
    .unwrap();
    Arc::new(AgentContext::with_publisher(config, registry, store, publisher))
}

/// Checker that plays back a fixed sequence of outcomes, then repeats the
/// last one.
pub struct ScriptedChecker {
    script: Mutex<VecDeque<bool>>,
    last: Mutex<bool>,
    calls: AtomicUsize,
}

impl ScriptedChecker {
    pub fn new(outcomes: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.iter().copied().collect()),
            last: Mutex::new(outcomes.last().copied().unwrap_or(true)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Checker for ScriptedChecker {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn check(&self, _job: &mut CheckJob) -> CheckResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let success = match self.script.lock().unwrap().pop_front() {
            Some(success) => {
                *self.last.lock().unwrap() = success;
                success
            }
            None => *self.last.lock().unwrap(),
        };
        let result = CheckResult::started_at(now_ms());
        if success {
            result.up("200", "OK")
        } else {
            result.down("timeout", "Error: Timed out")
        }
    }
}

pub fn scripted_registry(checker: &Arc<ScriptedChecker>) -> CheckerRegistry {
    let mut registry = CheckerRegistry::new();
    registry.register(Arc::clone(checker) as Arc<dyn Checker>);
    registry
}
