//! # In-Memory Forward-Chaining Engine
//!
//! Built-in implementation of the engine interface. Rules are compiled Rust
//! closures; working memory is an insertion-ordered fact table partitioned by
//! entry point.
//!
//! ## Evaluation
//!
//! A pass repeatedly picks the first activation (rules by descending salience,
//! facts by insertion order) and runs its action until none remain. Each
//! (rule, fact) pair fires at most once, so an action that mutates its own
//! fact in place does not re-trigger itself. Facts inserted by an action join
//! the same pass.
//!
//! ## Continuous evaluation
//!
//! [`InMemoryStatefulSession::fire_until_halt`] runs a pass, then parks on a
//! [`Notify`] until the next insertion or a halt request. Halting is observed
//! between passes; a running pass always completes.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, RwLock, Weak,
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::knowledge::Rule;
use super::{
    EngineError, EngineEvent, EngineEventListener, EngineResult, EntryPoint, Environment,
    FactHandle, Globals, KnowledgeBase, StatefulSession, StatelessSession, DEFAULT_ENTRY_POINT,
};
use crate::channel::Channel;
use crate::config::SessionConfig;

#[derive(Debug)]
pub(crate) struct KnowledgeInner {
    id: String,
    rules: Vec<Rule>,
    entry_points: BTreeSet<String>,
}

impl KnowledgeInner {
    fn declares(&self, entry_point: &str) -> bool {
        entry_point == DEFAULT_ENTRY_POINT || self.entry_points.contains(entry_point)
    }
}

#[derive(Clone, Debug)]
pub struct InMemoryKnowledgeBase {
    inner: Arc<KnowledgeInner>,
}

impl InMemoryKnowledgeBase {
    pub(crate) fn new(rules: Vec<Rule>, entry_points: BTreeSet<String>) -> Self {
        Self {
            inner: Arc::new(KnowledgeInner {
                id: Uuid::new_v4().to_string(),
                rules,
                entry_points,
            }),
        }
    }

    /// Rule names in firing priority order.
    pub fn rule_names(&self) -> Vec<String> {
        self.inner.rules.iter().map(|r| r.name.clone()).collect()
    }
}

impl KnowledgeBase for InMemoryKnowledgeBase {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn entry_points(&self) -> Vec<String> {
        self.inner.entry_points.iter().cloned().collect()
    }

    fn new_stateless_session(&self, config: &SessionConfig) -> Box<dyn StatelessSession> {
        Box::new(InMemoryStatelessSession {
            id: Uuid::new_v4().to_string(),
            knowledge: self.inner.clone(),
            config: config.clone(),
            globals: Globals::default(),
            listeners: Vec::new(),
        })
    }

    fn new_stateful_session(
        &self,
        config: &SessionConfig,
        environment: &Environment,
    ) -> Arc<dyn StatefulSession> {
        InMemoryStatefulSession::new(self.inner.clone(), config.clone(), environment.clone())
    }
}

/// What a rule action sees while it runs.
pub struct RuleContext<'a> {
    rule: &'a str,
    handle: FactHandle,
    entry_point: &'a str,
    fact: &'a mut Value,
    globals: &'a mut Globals,
    channels: Option<&'a DashMap<String, Arc<dyn Channel>>>,
    config: &'a SessionConfig,
    environment: &'a Environment,
    inserted: Vec<(String, Value)>,
    retracted: bool,
}

impl RuleContext<'_> {
    pub fn rule_name(&self) -> &str {
        self.rule
    }

    pub fn handle(&self) -> FactHandle {
        self.handle
    }

    pub fn entry_point(&self) -> &str {
        self.entry_point
    }

    pub fn fact(&self) -> &Value {
        self.fact
    }

    pub fn fact_mut(&mut self) -> &mut Value {
        self.fact
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.set(name, value);
    }

    pub fn insert(&mut self, fact: Value) {
        self.inserted.push((DEFAULT_ENTRY_POINT.to_string(), fact));
    }

    pub fn insert_into(&mut self, entry_point: &str, fact: Value) {
        self.inserted.push((entry_point.to_string(), fact));
    }

    /// Removes the current fact from working memory once the action returns.
    pub fn retract(&mut self) {
        self.retracted = true;
    }

    pub fn send(&self, channel: &str, fact: Value) -> EngineResult<()> {
        let channel = self
            .channels
            .and_then(|channels| channels.get(channel).map(|c| c.value().clone()))
            .ok_or_else(|| EngineError::ChannelNotFound(channel.to_string()))?;
        channel.send(fact)?;
        Ok(())
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.config.properties.get(name).map(String::as_str)
    }

    pub fn environment(&self, name: &str) -> Option<&Value> {
        self.environment.get(name)
    }

    pub fn fail(&self, message: &str) -> EngineError {
        EngineError::RuleFailed {
            rule: self.rule.to_string(),
            message: message.to_string(),
        }
    }
}

struct FactEntry {
    entry_point: String,
    value: Value,
}

#[derive(Default)]
struct WorkingMemory {
    facts: BTreeMap<FactHandle, FactEntry>,
    next_handle: u64,
    fired: HashSet<(usize, FactHandle)>,
    globals: Globals,
}

impl WorkingMemory {
    fn insert(&mut self, entry_point: &str, value: Value) -> FactHandle {
        self.next_handle += 1;
        let handle = FactHandle(self.next_handle);
        self.facts.insert(
            handle,
            FactEntry {
                entry_point: entry_point.to_string(),
                value,
            },
        );
        handle
    }

    fn next_activation(&self, rules: &[Rule]) -> Option<(usize, FactHandle)> {
        rules.iter().enumerate().find_map(|(index, rule)| {
            let partition = rule.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT);
            self.facts
                .iter()
                .find(|(handle, entry)| {
                    entry.entry_point == partition
                        && !self.fired.contains(&(index, **handle))
                        && (rule.condition)(&entry.value)
                })
                .map(|(handle, _)| (index, *handle))
        })
    }

    fn clear(&mut self) {
        self.facts.clear();
        self.fired.clear();
        self.globals = Globals::default();
    }
}

struct FireScope<'a> {
    session_id: &'a str,
    knowledge: &'a KnowledgeInner,
    config: &'a SessionConfig,
    environment: &'a Environment,
    channels: Option<&'a DashMap<String, Arc<dyn Channel>>>,
}

fn fire_pass(
    scope: &FireScope<'_>,
    memory: &mut WorkingMemory,
    events: &mut Vec<EngineEvent>,
) -> EngineResult<usize> {
    let mut fired: u64 = 0;
    while let Some((index, handle)) = memory.next_activation(&scope.knowledge.rules) {
        if let Some(limit) = scope.config.fire_limit {
            if fired >= limit {
                return Err(EngineError::FireLimitExceeded {
                    session_id: scope.session_id.to_string(),
                    limit,
                });
            }
        }
        memory.fired.insert((index, handle));

        let rule = &scope.knowledge.rules[index];
        let Some(entry) = memory.facts.get(&handle) else {
            continue;
        };
        let entry_point = entry.entry_point.clone();
        let mut fact = entry.value.clone();

        let mut context = RuleContext {
            rule: &rule.name,
            handle,
            entry_point: &entry_point,
            fact: &mut fact,
            globals: &mut memory.globals,
            channels: scope.channels,
            config: scope.config,
            environment: scope.environment,
            inserted: Vec::new(),
            retracted: false,
        };
        (rule.action)(&mut context)?;
        let inserted = std::mem::take(&mut context.inserted);
        let retracted = context.retracted;

        fired += 1;
        trace!("Rule fired: {} on {:?}", rule.name, handle);
        events.push(EngineEvent::RuleFired {
            session_id: scope.session_id.to_string(),
            rule: rule.name.clone(),
            handle,
        });

        if retracted {
            memory.facts.remove(&handle);
        } else if let Some(entry) = memory.facts.get_mut(&handle) {
            entry.value = fact;
        }

        for (entry_point, value) in inserted {
            if !scope.knowledge.declares(&entry_point) {
                return Err(EngineError::RuleFailed {
                    rule: rule.name.clone(),
                    message: format!("unknown entry point '{}'", entry_point),
                });
            }
            let new_handle = memory.insert(&entry_point, value.clone());
            events.push(EngineEvent::FactInserted {
                session_id: scope.session_id.to_string(),
                entry_point,
                handle: new_handle,
                fact: value,
            });
        }
    }
    Ok(fired as usize)
}

fn notify_all(listeners: &[Arc<dyn EngineEventListener>], events: &[EngineEvent]) {
    for event in events {
        for listener in listeners {
            listener.on_event(event);
        }
    }
}

pub struct InMemoryStatelessSession {
    id: String,
    knowledge: Arc<KnowledgeInner>,
    config: SessionConfig,
    globals: Globals,
    listeners: Vec<Arc<dyn EngineEventListener>>,
}

impl StatelessSession for InMemoryStatelessSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_global(&mut self, name: &str, value: Value) {
        self.globals.set(name, value);
    }

    fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    fn add_listener(&mut self, listener: Arc<dyn EngineEventListener>) {
        self.listeners.push(listener);
    }

    /// A retracted fact comes back as `Value::Null`.
    fn execute(&mut self, fact: Value) -> EngineResult<Value> {
        let mut memory = WorkingMemory {
            globals: std::mem::take(&mut self.globals),
            ..Default::default()
        };
        let handle = memory.insert(DEFAULT_ENTRY_POINT, fact.clone());
        let mut events = vec![EngineEvent::FactInserted {
            session_id: self.id.clone(),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            handle,
            fact,
        }];

        let environment = Environment::default();
        let scope = FireScope {
            session_id: &self.id,
            knowledge: &self.knowledge,
            config: &self.config,
            environment: &environment,
            channels: None,
        };
        let result = fire_pass(&scope, &mut memory, &mut events);
        self.globals = std::mem::take(&mut memory.globals);
        notify_all(&self.listeners, &events);

        let fired = result?;
        debug!("Stateless session {} fired {} rules", self.id, fired);
        Ok(memory
            .facts
            .remove(&handle)
            .map(|entry| entry.value)
            .unwrap_or(Value::Null))
    }
}

pub struct InMemoryStatefulSession {
    id: String,
    knowledge: Arc<KnowledgeInner>,
    config: SessionConfig,
    environment: Environment,
    memory: Mutex<WorkingMemory>,
    channels: DashMap<String, Arc<dyn Channel>>,
    listeners: RwLock<Vec<Arc<dyn EngineEventListener>>>,
    halted: AtomicBool,
    disposed: AtomicBool,
    wakeup: Notify,
    self_ref: Weak<InMemoryStatefulSession>,
}

impl InMemoryStatefulSession {
    fn new(
        knowledge: Arc<KnowledgeInner>,
        config: SessionConfig,
        environment: Environment,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: Uuid::new_v4().to_string(),
            knowledge,
            config,
            environment,
            memory: Mutex::new(WorkingMemory::default()),
            channels: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            halted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            wakeup: Notify::new(),
            self_ref: self_ref.clone(),
        })
    }

    fn disposed_error(&self) -> EngineError {
        EngineError::Disposed {
            session_id: self.id.clone(),
        }
    }

    fn lock_memory(&self) -> EngineResult<MutexGuard<'_, WorkingMemory>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(self.disposed_error());
        }
        self.memory
            .lock()
            .map_err(|e| EngineError::Poisoned(e.to_string()))
    }

    fn emit(&self, events: &[EngineEvent]) {
        match self.listeners.read() {
            Ok(listeners) => notify_all(&listeners, events),
            Err(e) => warn!("Listener list poisoned in session {}: {}", self.id, e),
        }
    }

    fn stop_requested(&self) -> bool {
        self.halted.load(Ordering::SeqCst) || self.disposed.load(Ordering::SeqCst)
    }

    fn insert_into(&self, entry_point: &str, fact: Value) -> EngineResult<FactHandle> {
        let handle = self.lock_memory()?.insert(entry_point, fact.clone());
        self.emit(&[EngineEvent::FactInserted {
            session_id: self.id.clone(),
            entry_point: entry_point.to_string(),
            handle,
            fact,
        }]);
        self.wakeup.notify_one();
        Ok(handle)
    }
}

#[async_trait]
impl StatefulSession for InMemoryStatefulSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_global(&self, name: &str, value: Value) -> EngineResult<()> {
        self.lock_memory()?.globals.set(name, value);
        Ok(())
    }

    fn global(&self, name: &str) -> EngineResult<Option<Value>> {
        Ok(self.lock_memory()?.globals.get(name).cloned())
    }

    fn insert(&self, fact: Value) -> EngineResult<FactHandle> {
        self.insert_into(DEFAULT_ENTRY_POINT, fact)
    }

    fn fact(&self, handle: FactHandle) -> EngineResult<Option<Value>> {
        Ok(self
            .lock_memory()?
            .facts
            .get(&handle)
            .map(|entry| entry.value.clone()))
    }

    fn entry_point(&self, name: &str) -> Option<Arc<dyn EntryPoint>> {
        if self.disposed.load(Ordering::SeqCst) || !self.knowledge.declares(name) {
            return None;
        }
        Some(Arc::new(SessionEntryPoint {
            name: name.to_string(),
            session_id: self.id.clone(),
            session: self.self_ref.clone(),
        }))
    }

    fn register_channel(&self, name: &str, channel: Arc<dyn Channel>) -> EngineResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(self.disposed_error());
        }
        self.channels.insert(name.to_string(), channel);
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn EngineEventListener>) -> EngineResult<()> {
        self.listeners
            .write()
            .map_err(|e| EngineError::Poisoned(e.to_string()))?
            .push(listener);
        Ok(())
    }

    fn fire_all_rules(&self) -> EngineResult<usize> {
        let mut events = Vec::new();
        let result = {
            let mut memory = self.lock_memory()?;
            let scope = FireScope {
                session_id: &self.id,
                knowledge: &self.knowledge,
                config: &self.config,
                environment: &self.environment,
                channels: Some(&self.channels),
            };
            fire_pass(&scope, &mut memory, &mut events)
        };
        self.emit(&events);
        result
    }

    async fn fire_until_halt(&self) -> EngineResult<()> {
        debug!("Session {} entering continuous evaluation", self.id);
        loop {
            if self.stop_requested() {
                break;
            }
            match self.fire_all_rules() {
                Ok(fired) => trace!("Session {} pass fired {} rules", self.id, fired),
                Err(EngineError::Disposed { .. }) => break,
                Err(e) => warn!("Continuous evaluation pass failed in {}: {}", self.id, e),
            }
            if self.stop_requested() {
                break;
            }
            self.wakeup.notified().await;
        }
        debug!("Session {} left continuous evaluation", self.id);
        Ok(())
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.halted.store(true, Ordering::SeqCst);
        match self.memory.lock() {
            Ok(mut memory) => memory.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        self.channels.clear();
        self.wakeup.notify_one();
        self.emit(&[EngineEvent::SessionDisposed {
            session_id: self.id.clone(),
        }]);
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.clear();
        }
        debug!("Session {} disposed", self.id);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

struct SessionEntryPoint {
    name: String,
    session_id: String,
    session: Weak<InMemoryStatefulSession>,
}

impl EntryPoint for SessionEntryPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, fact: Value) -> EngineResult<FactHandle> {
        let session = self.session.upgrade().ok_or_else(|| EngineError::Disposed {
            session_id: self.session_id.clone(),
        })?;
        session.insert_into(&self.name, fact)
    }
}
