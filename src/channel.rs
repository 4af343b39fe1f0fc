//! Output channels rules use to hand facts to services outside the engine.
//!
//! Channel kinds are created through a [`ChannelRegistry`] factory table,
//! keyed by the `kind` string in the channel descriptor. The `service` kind
//! wraps each fact in a [`Message`] and invokes a [`ServiceReference`] that is
//! resolved from the reference table whenever a stateful session is created.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::exchange::{Message, QName, ReferenceTable, ServiceReference};

pub const SERVICE_CHANNEL_KIND: &str = "service";
pub const LOG_CHANNEL_KIND: &str = "log";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Channel {channel} has no bound service reference")]
    Unbound { channel: String },

    #[error("Invocation of {reference} failed: {message}")]
    InvocationFailed { reference: String, message: String },
}

pub type ChannelResult<T> = Result<T, ChannelError>;

pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, fact: Value) -> ChannelResult<()>;

    /// Channels that deliver to a service reference expose their binding here.
    fn reference_binding(&self) -> Option<&dyn ReferenceBinding> {
        None
    }
}

pub trait ReferenceBinding: Send + Sync {
    fn reference_name(&self) -> &str;

    fn bind(&self, reference: Option<Arc<dyn ServiceReference>>);
}

/// Delivers facts to a service reference, optionally naming an operation.
pub struct ServiceChannel {
    name: String,
    operation: Option<String>,
    reference_name: String,
    reference: RwLock<Option<Arc<dyn ServiceReference>>>,
}

impl ServiceChannel {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            name: config.name.clone(),
            operation: config.operation.clone(),
            reference_name: config
                .reference
                .clone()
                .unwrap_or_else(|| config.name.clone()),
            reference: RwLock::new(None),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.reference
            .read()
            .map(|reference| reference.is_some())
            .unwrap_or(false)
    }
}

impl Channel for ServiceChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, fact: Value) -> ChannelResult<()> {
        let reference = self
            .reference
            .read()
            .ok()
            .and_then(|reference| reference.clone())
            .ok_or_else(|| ChannelError::Unbound {
                channel: self.name.clone(),
            })?;
        debug!("Channel {} delivering to {}", self.name, reference.name());
        reference.invoke(self.operation.clone(), Message::new(fact))
    }

    fn reference_binding(&self) -> Option<&dyn ReferenceBinding> {
        Some(self)
    }
}

impl ReferenceBinding for ServiceChannel {
    fn reference_name(&self) -> &str {
        &self.reference_name
    }

    fn bind(&self, reference: Option<Arc<dyn ServiceReference>>) {
        match self.reference.write() {
            Ok(mut slot) => *slot = reference,
            Err(poisoned) => *poisoned.into_inner() = reference,
        }
    }
}

/// Writes every fact it receives to the tracing output.
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            name: config.name.clone(),
        }
    }
}

impl Channel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, fact: Value) -> ChannelResult<()> {
        info!(target: "rulebridge::channel", channel = %self.name, "{}", fact);
        Ok(())
    }
}

pub type ChannelFactory = fn(&ChannelConfig) -> Arc<dyn Channel>;

#[derive(Clone)]
pub struct ChannelRegistry {
    factories: Arc<DashMap<String, ChannelFactory>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ChannelRegistry {
    /// Registry without any kinds.
    pub fn empty() -> Self {
        Self {
            factories: Arc::new(DashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register(SERVICE_CHANNEL_KIND, |config| {
            Arc::new(ServiceChannel::new(config)) as Arc<dyn Channel>
        });
        registry.register(LOG_CHANNEL_KIND, |config| {
            Arc::new(LogChannel::new(config)) as Arc<dyn Channel>
        });
        registry
    }

    pub fn register(&self, kind: &str, factory: ChannelFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn create(&self, config: &ChannelConfig) -> Option<Arc<dyn Channel>> {
        let kind = config.kind.as_deref().unwrap_or(SERVICE_CHANNEL_KIND);
        self.factories.get(kind).map(|factory| (*factory)(config))
    }

    /// Builds every configured channel. Descriptors of unregistered kinds are skipped.
    pub fn build_channels(&self, configs: &[ChannelConfig]) -> Vec<Arc<dyn Channel>> {
        configs
            .iter()
            .filter_map(|config| {
                let channel = self.create(config);
                if channel.is_none() {
                    warn!(
                        "Channel {} skipped: unknown kind {:?}",
                        config.name, config.kind
                    );
                }
                channel
            })
            .collect()
    }
}

/// Resolves each channel's reference against the table, qualified with `namespace`.
///
/// Missing references leave the channel unbound; sending through it then fails.
pub fn bind_references(
    channels: &[Arc<dyn Channel>],
    namespace: &str,
    references: &ReferenceTable,
) {
    for channel in channels {
        let Some(binding) = channel.reference_binding() else {
            continue;
        };
        let qname = QName::new(namespace, binding.reference_name());
        let reference = references.get(&qname).cloned();
        if reference.is_none() {
            warn!("No service reference {} for channel {}", qname, channel.name());
        }
        binding.bind(reference);
    }
}
