//! Rule definitions, the knowledge builder and the resource catalog.
//!
//! Rule resources are registered in a [`RuleCatalog`] under a name, and the
//! component configuration refers to them by that name. Compilation collects
//! every referenced resource into a [`KnowledgeBuilder`] and validates the
//! result before producing a knowledge base.

use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use super::memory::{InMemoryKnowledgeBase, RuleContext};
use super::{EngineError, EngineResult, DEFAULT_ENTRY_POINT};

pub type Condition = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type Action = Arc<dyn Fn(&mut RuleContext<'_>) -> EngineResult<()> + Send + Sync>;

/// A single rule: a condition over one fact and an action run when it matches.
#[derive(Clone)]
pub struct Rule {
    pub(crate) name: String,
    pub(crate) entry_point: Option<String>,
    pub(crate) salience: i32,
    pub(crate) condition: Condition,
    pub(crate) action: Action,
}

impl Rule {
    pub fn new<F>(name: &str, action: F) -> Self
    where
        F: Fn(&mut RuleContext<'_>) -> EngineResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            entry_point: None,
            salience: 0,
            condition: Arc::new(|_: &Value| true),
            action: Arc::new(action),
        }
    }

    pub fn when<C>(mut self, condition: C) -> Self
    where
        C: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.condition = Arc::new(condition);
        self
    }

    /// Restricts the rule to facts inserted through the named entry point.
    pub fn from_entry_point(mut self, entry_point: &str) -> Self {
        self.entry_point = Some(entry_point.to_string());
        self
    }

    /// Higher salience fires first.
    pub fn salience(mut self, salience: i32) -> Self {
        self.salience = salience;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("entry_point", &self.entry_point)
            .field("salience", &self.salience)
            .finish()
    }
}

#[derive(Default, Debug)]
pub struct KnowledgeBuilder {
    rules: Vec<Rule>,
    entry_points: BTreeSet<String>,
}

impl KnowledgeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: Rule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    pub fn declare_entry_point(&mut self, name: &str) -> &mut Self {
        self.entry_points.insert(name.to_string());
        self
    }

    pub fn build(self) -> EngineResult<InMemoryKnowledgeBase> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();
        for rule in &self.rules {
            if !names.insert(rule.name.as_str()) {
                errors.push(format!("duplicate rule name '{}'", rule.name));
            }
            if let Some(entry_point) = &rule.entry_point {
                if entry_point != DEFAULT_ENTRY_POINT && !self.entry_points.contains(entry_point)
                {
                    errors.push(format!(
                        "rule '{}' uses undeclared entry point '{}'",
                        rule.name, entry_point
                    ));
                }
            }
        }
        if !errors.is_empty() {
            return Err(EngineError::Compilation(errors.join("; ")));
        }

        let mut rules = self.rules;
        // stable: equal salience keeps declaration order
        rules.sort_by(|a, b| b.salience.cmp(&a.salience));
        debug!(
            "Knowledge compiled: {} rules, entry points {:?}",
            rules.len(),
            self.entry_points
        );
        Ok(InMemoryKnowledgeBase::new(rules, self.entry_points))
    }
}

/// A named unit of rules the catalog can compile.
pub trait RuleResource: Send + Sync {
    fn name(&self) -> &str;

    /// Changes whenever the resource content changes; watched by the knowledge agent.
    fn revision(&self) -> u64 {
        0
    }

    fn load(&self, builder: &mut KnowledgeBuilder) -> EngineResult<()>;
}

type Loader = Box<dyn Fn(&mut KnowledgeBuilder) -> EngineResult<()> + Send + Sync>;

/// Resource backed by a loader closure.
pub struct FnResource {
    name: String,
    revision: AtomicU64,
    loader: Loader,
}

impl FnResource {
    pub fn new<F>(name: &str, loader: F) -> Self
    where
        F: Fn(&mut KnowledgeBuilder) -> EngineResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            revision: AtomicU64::new(0),
            loader: Box::new(loader),
        }
    }

    /// Marks the resource as changed.
    pub fn touch(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }
}

impl RuleResource for FnResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn load(&self, builder: &mut KnowledgeBuilder) -> EngineResult<()> {
        (self.loader)(builder)
    }
}

/// Compile-time registry of rule resources, keyed by name.
#[derive(Clone, Default)]
pub struct RuleCatalog {
    resources: Arc<DashMap<String, Arc<dyn RuleResource>>>,
}

impl RuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resource: Arc<dyn RuleResource>) {
        self.resources.insert(resource.name().to_string(), resource);
    }

    pub fn with(self, resource: Arc<dyn RuleResource>) -> Self {
        self.register(resource);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RuleResource>> {
        self.resources.get(name).map(|entry| entry.value().clone())
    }

    pub fn revisions(&self, names: &[String]) -> EngineResult<Vec<u64>> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .map(|resource| resource.revision())
                    .ok_or_else(|| EngineError::UnknownResource(name.clone()))
            })
            .collect()
    }

    pub fn compile(&self, names: &[String]) -> EngineResult<InMemoryKnowledgeBase> {
        let mut builder = KnowledgeBuilder::new();
        for name in names {
            let resource = self
                .get(name)
                .ok_or_else(|| EngineError::UnknownResource(name.clone()))?;
            resource.load(&mut builder)?;
        }
        builder.build()
    }
}
