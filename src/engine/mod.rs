//! # Rule Engine Interface
//!
//! The handler drives the rule engine through a deliberately narrow surface:
//! load a knowledge base, create a session, insert a fact, fire, halt, dispose.
//! Everything behind these traits is opaque to the dispatcher and the session
//! lifecycle manager.
//!
//! ```text
//! KnowledgeBase ──new_stateless_session──▶ StatelessSession (one per call)
//!       │
//!       └────────new_stateful_session───▶ StatefulSession (shared, long-lived)
//!                                              │
//!                                              ├── EntryPoint (named partition)
//!                                              └── Channel   (outbound adapter)
//! ```
//!
//! [`memory`] provides the built-in forward-chaining implementation and
//! [`knowledge`] the builder and resource catalog used to compile it.

pub mod knowledge;
pub mod memory;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::channel::{Channel, ChannelError};
use crate::config::SessionConfig;

/// Name of the partition facts land in when no entry point is given.
pub const DEFAULT_ENTRY_POINT: &str = "DEFAULT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FactHandle(pub u64);

/// Named values shared between the caller and the rules of one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Globals {
    values: HashMap<String, Value>,
}

impl Globals {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }
}

/// Execution environment handed to every stateful session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    values: HashMap<String, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    FactInserted {
        session_id: String,
        entry_point: String,
        handle: FactHandle,
        fact: Value,
    },
    RuleFired {
        session_id: String,
        rule: String,
        handle: FactHandle,
    },
    SessionDisposed {
        session_id: String,
    },
}

pub trait EngineEventListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

/// Compiled rule set shared read-only by every session created from it.
pub trait KnowledgeBase: Send + Sync {
    fn id(&self) -> &str;

    fn entry_points(&self) -> Vec<String>;

    fn new_stateless_session(&self, config: &SessionConfig) -> Box<dyn StatelessSession>;

    fn new_stateful_session(
        &self,
        config: &SessionConfig,
        environment: &Environment,
    ) -> Arc<dyn StatefulSession>;
}

pub trait StatelessSession: Send {
    fn id(&self) -> &str;

    fn set_global(&mut self, name: &str, value: Value);

    fn global(&self, name: &str) -> Option<Value>;

    fn add_listener(&mut self, listener: Arc<dyn EngineEventListener>);

    /// Runs a single evaluation pass over `fact` and returns the fact as the rules left it.
    fn execute(&mut self, fact: Value) -> EngineResult<Value>;
}

#[async_trait]
pub trait StatefulSession: Send + Sync {
    fn id(&self) -> &str;

    fn set_global(&self, name: &str, value: Value) -> EngineResult<()>;

    fn global(&self, name: &str) -> EngineResult<Option<Value>>;

    fn insert(&self, fact: Value) -> EngineResult<FactHandle>;

    /// Current value of a fact, `None` once it has been retracted.
    fn fact(&self, handle: FactHandle) -> EngineResult<Option<Value>>;

    fn entry_point(&self, name: &str) -> Option<Arc<dyn EntryPoint>>;

    fn register_channel(&self, name: &str, channel: Arc<dyn Channel>) -> EngineResult<()>;

    fn add_listener(&self, listener: Arc<dyn EngineEventListener>) -> EngineResult<()>;

    fn fire_all_rules(&self) -> EngineResult<usize>;

    /// Evaluates continuously as facts arrive until [`StatefulSession::halt`] is observed.
    async fn fire_until_halt(&self) -> EngineResult<()>;

    fn halt(&self);

    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

pub trait EntryPoint: Send + Sync {
    fn name(&self) -> &str;

    fn insert(&self, fact: Value) -> EngineResult<FactHandle>;
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Knowledge compilation failed: {0}")]
    Compilation(String),

    #[error("Unknown rule resource: {0}")]
    UnknownResource(String),

    #[error("Session {session_id} is disposed")]
    Disposed { session_id: String },

    #[error("Rule {rule} failed: {message}")]
    RuleFailed { rule: String, message: String },

    #[error("Fire limit of {limit} exceeded in session {session_id}")]
    FireLimitExceeded { session_id: String, limit: u64 },

    #[error("Channel not registered: {0}")]
    ChannelNotFound(String),

    #[error("Session state poisoned: {0}")]
    Poisoned(String),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

pub type EngineResult<T> = Result<T, EngineError>;
