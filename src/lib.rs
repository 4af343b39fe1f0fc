//! # rulebridge: Rule Engine Exchange Handler
//!
//! rulebridge connects an inbound message-exchange pipeline to a rule
//! evaluation engine. Each inbound exchange names an operation; the handler
//! maps that operation to an evaluation mode, runs the rules, and replies when
//! the operation expects a response.
//!
//! ## Evaluation Modes
//!
//! - `EXECUTE`: one-shot evaluation in a private stateless session
//! - `FIRE_ALL`: insert into the shared stateful session and run a full pass
//! - `FIRE_UNTIL_HALT`: insert into the shared stateful session, evaluated
//!   continuously by a background worker until halted
//!
//! ## Components
//!
//! ```text
//! Exchange ─▶ RulesExchangeHandler ─┬─▶ EngineBinding ─▶ KnowledgeBase ─▶ StatelessSession
//!                                   │        ▲
//!                                   │        └── KnowledgeAgent (hot swap)
//!                                   └─▶ SessionLifecycle ─▶ StatefulSession
//!                                            │                  ├── Channel ─▶ ServiceReference
//!                                            │                  └── AuditLog
//!                                            └── continuous worker (tokio task)
//! ```
//!
//! - Dispatch and lifecycle hooks ([`handler`])
//! - Stateful session slot, locks and worker ([`session`])
//! - Knowledge base loading and refresh ([`binding`])
//! - Engine interface and built-in engine ([`engine`])
//! - Output adapters ([`channel`]) and audit trail ([`audit`])
//! - Exchange surface ([`exchange`]), configuration ([`config`]), errors ([`error`])
//!
//! ## Concurrency
//!
//! `FIRE_ALL` and `FIRE_UNTIL_HALT` bodies are serialized by the invocation
//! lock, so insert and fire pairs on the shared session never interleave.
//! Session creation and disposal run under a separate lifecycle lock and
//! require proof of holding the invocation lock. `EXECUTE` takes neither.

pub mod audit;
pub mod binding;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod session;

// Re-exports
pub use config::{ActionConfig, ActionType, ChannelConfig, RulesComponentConfig};
pub use engine::knowledge::{FnResource, KnowledgeBuilder, Rule, RuleCatalog, RuleResource};
pub use error::{HandlerError, HandlerResult};
pub use exchange::{Context, Exchange, Message, QName, ServiceOperation};
pub use handler::RulesExchangeHandler;
pub use session::SessionPhase;
