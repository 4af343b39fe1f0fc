//! # Message Exchange Surface
//!
//! The handler consumes exchanges from the surrounding message fabric and
//! produces replies back into it. This module defines the narrow view of that
//! fabric the handler depends on:
//!
//! - [`Exchange`]: one request/reply unit with its phase, context and message
//! - [`Message`]: a mutable JSON payload plus properties
//! - [`Context`]: out-of-band directives such as "dispose after this call"
//! - [`ServiceReference`]: a live service a channel can invoke
//!
//! Replies travel through a oneshot channel, so a requester awaits
//! [`ReplyReceiver::recv`] the same way the request manager awaits a response.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::channel::{ChannelError, ChannelResult};
use crate::error::{HandlerError, HandlerResult};

/// Context property asking the handler to dispose the stateful session after the call.
pub const DISPOSE_PROPERTY: &str = "rules.dispose";
/// Context property overriding the configured action type for one call.
pub const ACTION_PROPERTY: &str = "rules.action";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ExchangePhase {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
pub enum ExchangePattern {
    #[default]
    InOnly,
    InOut,
}

/// Qualified service name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QName {
    pub namespace: String,
    pub local: String,
}

impl QName {
    pub fn new(namespace: &str, local: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            local: local.to_string(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{{{}}}{}", self.namespace, self.local)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: None,
            properties: HashMap::new(),
        }
    }
}

impl Message {
    pub fn new(content: Value) -> Self {
        Self {
            content: Some(content),
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }
}

/// Out-of-band directives attached to an exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    properties: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.properties.insert(key.to_string(), value);
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// True when the caller asked for the stateful session to be disposed after this call.
    pub fn is_dispose(&self) -> bool {
        match self.properties.get(DISPOSE_PROPERTY) {
            Some(Value::Bool(dispose)) => *dispose,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn action_override(&self) -> Option<String> {
        self.properties.get(ACTION_PROPERTY).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOperation {
    pub name: String,
    pub pattern: ExchangePattern,
}

impl ServiceOperation {
    pub fn in_only(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: ExchangePattern::InOnly,
        }
    }

    pub fn in_out(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: ExchangePattern::InOut,
        }
    }
}

pub struct Exchange {
    id: String,
    phase: ExchangePhase,
    operation: ServiceOperation,
    context: Context,
    message: Message,
    reply_tx: Option<oneshot::Sender<Message>>,
}

impl Exchange {
    /// Creates an inbound exchange and the receiver its reply will arrive on.
    pub fn request(operation: ServiceOperation, message: Message) -> (Self, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let exchange = Self {
            id: Uuid::new_v4().to_string(),
            phase: ExchangePhase::In,
            operation,
            context: Context::default(),
            message,
            reply_tx: Some(tx),
        };
        (exchange, ReplyReceiver { receiver: rx })
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_phase(mut self, phase: ExchangePhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> ExchangePhase {
        self.phase
    }

    pub fn operation(&self) -> &ServiceOperation {
        &self.operation
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn create_message(&self) -> Message {
        Message::empty()
    }

    /// Sends the reply back to the requester and moves the exchange to the out phase.
    pub fn send(&mut self, message: Message) -> HandlerResult<()> {
        let tx = self.reply_tx.take().ok_or_else(|| HandlerError::ReplyFailed {
            exchange_id: self.id.clone(),
            message: "reply already sent".to_string(),
        })?;
        self.phase = ExchangePhase::Out;
        tx.send(message).map_err(|_| HandlerError::ReplyFailed {
            exchange_id: self.id.clone(),
            message: "requester dropped the reply receiver".to_string(),
        })
    }
}

pub struct ReplyReceiver {
    receiver: oneshot::Receiver<Message>,
}

impl ReplyReceiver {
    /// Waits for the reply. Returns `None` if the exchange was dropped without replying.
    pub async fn recv(self) -> Option<Message> {
        self.receiver.await.ok()
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

/// A live service a channel can deliver facts to.
#[mockall::automock]
pub trait ServiceReference: Send + Sync {
    fn name(&self) -> QName;
    fn invoke(&self, operation: Option<String>, message: Message) -> ChannelResult<()>;
}

/// Service name to live reference, provided by the hosting runtime at init.
pub type ReferenceTable = HashMap<QName, Arc<dyn ServiceReference>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub operation: Option<String>,
    pub message: Message,
}

/// Reference that forwards every invocation into an unbounded queue.
pub struct QueueReference {
    name: QName,
    sender: mpsc::UnboundedSender<Invocation>,
}

impl QueueReference {
    pub fn new(name: QName) -> (Self, mpsc::UnboundedReceiver<Invocation>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { name, sender }, receiver)
    }
}

impl ServiceReference for QueueReference {
    fn name(&self) -> QName {
        self.name.clone()
    }

    fn invoke(&self, operation: Option<String>, message: Message) -> ChannelResult<()> {
        self.sender
            .send(Invocation { operation, message })
            .map_err(|e| ChannelError::InvocationFailed {
                reference: self.name.to_string(),
                message: e.to_string(),
            })
    }
}
