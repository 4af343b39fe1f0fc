//! Engine binding: owns the knowledge base and creates sessions from it.
//!
//! The base is either compiled once at initialization or served by a
//! [`KnowledgeAgent`] that rebuilds it when a rule resource changes. In agent
//! mode every session creation reads the base through the agent, so a swap is
//! picked up by the next session while running sessions keep the base they
//! were created from.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use serde_json::json;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};

use crate::config::{RulesComponentConfig, SessionConfig};
use crate::engine::knowledge::RuleCatalog;
use crate::engine::{
    EngineResult, Environment, KnowledgeBase, StatefulSession, StatelessSession,
};

/// Keeps the current knowledge base up to date with its resources.
pub struct KnowledgeAgent {
    catalog: RuleCatalog,
    resources: Vec<String>,
    current: RwLock<Arc<dyn KnowledgeBase>>,
    revisions: Mutex<Vec<u64>>,
    running: AtomicBool,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl KnowledgeAgent {
    pub fn new(catalog: RuleCatalog, resources: Vec<String>) -> EngineResult<Self> {
        let revisions = catalog.revisions(&resources)?;
        let knowledge = catalog.compile(&resources)?;
        Ok(Self {
            catalog,
            resources,
            current: RwLock::new(Arc::new(knowledge)),
            revisions: Mutex::new(revisions),
            running: AtomicBool::new(false),
            scanner: Mutex::new(None),
        })
    }

    pub async fn knowledge_base(&self) -> Arc<dyn KnowledgeBase> {
        self.current.read().await.clone()
    }

    /// Rebuilds the base if any resource revision moved. Returns whether a swap happened.
    ///
    /// A failed rebuild keeps the previous base in service.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> EngineResult<bool> {
        let mut revisions = self.revisions.lock().await;
        let latest = self.catalog.revisions(&self.resources)?;
        if *revisions == latest {
            return Ok(false);
        }
        let knowledge = self.catalog.compile(&self.resources)?;
        let id = knowledge.id().to_string();
        *self.current.write().await = Arc::new(knowledge);
        *revisions = latest;
        info!("Knowledge base swapped: {}", id);
        Ok(true)
    }

    pub fn is_scanning(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn start_scanning(self: &Arc<Self>, interval: Duration) {
        let mut scanner = self.scanner.lock().await;
        if scanner.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let agent: Weak<Self> = Arc::downgrade(self);
        *scanner = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // first tick completes immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                let Some(agent) = agent.upgrade() else {
                    break;
                };
                if !agent.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = agent.refresh().await {
                    warn!("Knowledge refresh failed: {}", e);
                }
            }
            debug!("Knowledge scanner stopped");
        }));
        debug!("Knowledge scanner started: {:?}", interval);
    }

    pub async fn dispose(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.scanner.lock().await.take() {
            handle.abort();
        }
    }
}

pub enum KnowledgeSource {
    Static(Arc<dyn KnowledgeBase>),
    Agent(Arc<KnowledgeAgent>),
}

pub struct EngineBinding {
    source: KnowledgeSource,
    session_config: SessionConfig,
    environment: Environment,
}

impl EngineBinding {
    /// Compiles the configured resources. Any failure here aborts handler startup.
    #[instrument(skip_all, fields(service = %config.name))]
    pub async fn initialize(
        config: &RulesComponentConfig,
        catalog: &RuleCatalog,
    ) -> EngineResult<Self> {
        let resources = config.knowledge.resources.clone();
        let source = match &config.knowledge.agent {
            Some(agent_config) => {
                let agent = Arc::new(KnowledgeAgent::new(catalog.clone(), resources)?);
                if agent_config.scan_enabled {
                    agent.start_scanning(agent_config.scan_interval).await;
                }
                KnowledgeSource::Agent(agent)
            }
            None => KnowledgeSource::Static(Arc::new(catalog.compile(&resources)?)),
        };
        info!(
            "Engine binding initialized ({} resources, agent: {})",
            config.knowledge.resources.len(),
            matches!(source, KnowledgeSource::Agent(_))
        );
        Ok(Self::new(source, config))
    }

    pub fn new(source: KnowledgeSource, config: &RulesComponentConfig) -> Self {
        let environment = Environment::new()
            .with("target_namespace", json!(config.target_namespace))
            .with("service", json!(config.name));
        Self {
            source,
            session_config: config.session.clone(),
            environment,
        }
    }

    pub async fn knowledge_base(&self) -> Arc<dyn KnowledgeBase> {
        match &self.source {
            KnowledgeSource::Static(knowledge) => knowledge.clone(),
            KnowledgeSource::Agent(agent) => agent.knowledge_base().await,
        }
    }

    pub async fn new_stateless_session(&self) -> Box<dyn StatelessSession> {
        self.knowledge_base()
            .await
            .new_stateless_session(&self.session_config)
    }

    pub async fn new_stateful_session(&self) -> Arc<dyn StatefulSession> {
        self.knowledge_base()
            .await
            .new_stateful_session(&self.session_config, &self.environment)
    }

    pub fn agent(&self) -> Option<&Arc<KnowledgeAgent>> {
        match &self.source {
            KnowledgeSource::Agent(agent) => Some(agent),
            KnowledgeSource::Static(_) => None,
        }
    }

    pub async fn dispose(&self) {
        if let Some(agent) = self.agent() {
            agent.dispose().await;
        }
    }
}
