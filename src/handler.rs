//! # Rules Exchange Handler
//!
//! Per-message entry point mediating between the exchange fabric and the rule
//! engine.
//!
//! ## Dispatch
//!
//! | Action            | Session                  | Lock          | Reply payload        |
//! |-------------------|--------------------------|---------------|----------------------|
//! | `EXECUTE`         | fresh stateless session  | none          | evaluated content    |
//! | `FIRE_ALL`        | shared stateful session  | invocation    | evaluated content    |
//! | `FIRE_UNTIL_HALT` | shared stateful session  | invocation    | empty                |
//!
//! The action comes from the `rules.action` context property when present,
//! else from the descriptor of the invoked operation, else from the
//! configured default action.
//!
//! ## Message binding
//!
//! The inbound message is bound as the `message` global and its payload under
//! the configured content name. After evaluation the message is read back from
//! the global; when the rules left its content untouched, the evaluated fact
//! becomes the result payload.
//!
//! ## Lifecycle
//!
//! `init` builds the engine binding and the channels, `stop` disposes the
//! stateful session, and `destroy` releases everything. Messages arriving
//! after `destroy` fail with [`HandlerError::NotInitialized`].

use std::{collections::HashMap, str::FromStr, sync::Arc};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, instrument, Span};

use crate::audit::{open_audit_log, AuditGuard};
use crate::binding::EngineBinding;
use crate::channel::ChannelRegistry;
use crate::config::{ActionConfig, ActionType, RulesComponentConfig};
use crate::engine::knowledge::RuleCatalog;
use crate::engine::{EngineEventListener, StatefulSession};
use crate::error::{HandlerError, HandlerResult};
use crate::exchange::{Context, Exchange, ExchangePattern, ExchangePhase, Message, ReferenceTable};
use crate::session::{InvocationPermit, SessionLifecycle, SessionPhase};

/// Global the inbound message is bound to during evaluation.
pub const MESSAGE_GLOBAL: &str = "message";

struct HandlerCore {
    config: RulesComponentConfig,
    actions: HashMap<String, ActionConfig>,
    binding: Arc<EngineBinding>,
    lifecycle: SessionLifecycle,
    span: Span,
}

#[derive(Default)]
pub struct RulesExchangeHandler {
    core: RwLock<Option<Arc<HandlerCore>>>,
}

impl RulesExchangeHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn init(
        &self,
        config: RulesComponentConfig,
        references: ReferenceTable,
        catalog: &RuleCatalog,
    ) -> HandlerResult<()> {
        self.init_with_channels(config, references, catalog, &ChannelRegistry::with_defaults())
            .await
    }

    /// Initializes with a caller-supplied channel kind registry.
    #[instrument(skip_all, fields(service = %config.name))]
    pub async fn init_with_channels(
        &self,
        config: RulesComponentConfig,
        references: ReferenceTable,
        catalog: &RuleCatalog,
        registry: &ChannelRegistry,
    ) -> HandlerResult<()> {
        config.validate()?;
        if self.core.read().await.is_some() {
            self.destroy().await;
        }

        let binding = Arc::new(EngineBinding::initialize(&config, catalog).await?);
        let channels = registry.build_channels(&config.channels);
        let lifecycle = SessionLifecycle::new(binding.clone(), &config, channels, references);
        let core = HandlerCore {
            actions: config.action_map(),
            span: info_span!("rules_handler", service = %config.name),
            config,
            binding,
            lifecycle,
        };
        info!(
            "Rules handler initialized: {} actions, default {}",
            core.actions.len(),
            core.config.default_action
        );
        *self.core.write().await = Some(Arc::new(core));
        Ok(())
    }

    pub async fn start(&self) -> HandlerResult<()> {
        let core = self.core().await?;
        info!("Rules handler started: {}", core.config.name);
        Ok(())
    }

    /// Disposes the stateful session, waiting for any in-flight evaluation first.
    pub async fn stop(&self) -> HandlerResult<()> {
        let Some(core) = self.core.read().await.clone() else {
            return Ok(());
        };
        let permit = core.lifecycle.acquire().await;
        core.lifecycle.dispose(&permit).await;
        info!("Rules handler stopped: {}", core.config.name);
        Ok(())
    }

    pub async fn destroy(&self) {
        let Some(core) = self.core.write().await.take() else {
            return;
        };
        {
            let permit = core.lifecycle.acquire().await;
            core.lifecycle.close(&permit).await;
        }
        core.binding.dispose().await;
        info!("Rules handler destroyed: {}", core.config.name);
    }

    pub async fn is_initialized(&self) -> bool {
        self.core.read().await.is_some()
    }

    pub async fn session_phase(&self) -> SessionPhase {
        let core = self.core.read().await.clone();
        match core {
            Some(core) => core.lifecycle.phase().await,
            None => SessionPhase::Absent,
        }
    }

    pub async fn session_id(&self) -> Option<String> {
        let core = self.core.read().await.clone()?;
        core.lifecycle.session_id().await
    }

    pub async fn sessions_created(&self) -> u64 {
        self.core
            .read()
            .await
            .as_ref()
            .map(|core| core.lifecycle.sessions_created())
            .unwrap_or(0)
    }

    pub async fn continuous_worker_running(&self) -> bool {
        let core = self.core.read().await.clone();
        match core {
            Some(core) => core.lifecycle.worker_running().await,
            None => false,
        }
    }

    async fn core(&self) -> HandlerResult<Arc<HandlerCore>> {
        self.core
            .read()
            .await
            .clone()
            .ok_or(HandlerError::NotInitialized)
    }

    /// Handles one inbound exchange. Exchanges not in the in phase are ignored.
    ///
    /// A failed invocation leaves the stateful session as it was, even when the
    /// dispose directive is set. [`HandlerError::ReplyFailed`] is raised after
    /// evaluation, so its facts are already committed to the stateful session.
    #[instrument(
        skip_all,
        fields(exchange = %exchange.id(), operation = %exchange.operation().name)
    )]
    pub async fn handle_message(&self, exchange: &mut Exchange) -> HandlerResult<()> {
        if exchange.phase() != ExchangePhase::In {
            debug!("Ignoring exchange in phase {}", exchange.phase());
            return Ok(());
        }
        let core = self.core().await?;
        let result = core.dispatch(exchange).await;
        if let Err(e) = &result {
            error!("Rules invocation failed: {}", e);
        }
        result
    }
}

impl HandlerCore {
    fn action_type(&self, operation: &str, context: &Context) -> HandlerResult<ActionType> {
        if let Some(raw) = context.action_override() {
            return ActionType::from_str(&raw)
                .map_err(|_| HandlerError::UnsupportedAction { action: raw });
        }
        Ok(self
            .actions
            .get(operation)
            .and_then(|action| action.action_type)
            .unwrap_or(self.config.default_action))
    }

    async fn dispatch(&self, exchange: &mut Exchange) -> HandlerResult<()> {
        let operation = exchange.operation().clone();
        let action_type = self.action_type(&operation.name, exchange.context())?;
        let entry_point = self
            .actions
            .get(&operation.name)
            .and_then(|action| action.entry_point.clone());
        let dispose = exchange.context().is_dispose();
        let message = exchange.message().clone();
        debug!("Dispatching {} as {}", operation.name, action_type);

        let content = match action_type {
            ActionType::Execute => self.execute(&message).await?,
            ActionType::FireAll => self.fire_all(&message, dispose).await?,
            ActionType::FireUntilHalt => {
                self.fire_until_halt(&message, entry_point.as_deref(), dispose)
                    .await?
            }
        };

        if operation.pattern == ExchangePattern::InOut {
            let mut reply = exchange.create_message();
            if content.is_some() {
                reply.content = content;
            }
            exchange.send(reply)?;
        }
        Ok(())
    }

    async fn execute(&self, message: &Message) -> HandlerResult<Option<Value>> {
        let mut session = self.binding.new_stateless_session().await;
        let audit = AuditGuard::new(open_audit_log(self.config.audit.as_ref(), session.id())?);
        if let Some(log) = audit.log() {
            session.add_listener(log.clone() as Arc<dyn EngineEventListener>);
        }

        let fact = message.content.clone().unwrap_or(Value::Null);
        session.set_global(MESSAGE_GLOBAL, message_value(message)?);
        session.set_global(&self.config.message_content_name, fact.clone());
        let result = session.execute(fact)?;

        let evaluated = read_back(message, session.global(MESSAGE_GLOBAL), Some(result))?;
        Ok(evaluated.content)
    }

    async fn fire_all(&self, message: &Message, dispose: bool) -> HandlerResult<Option<Value>> {
        let permit = self.lifecycle.acquire().await;
        let content = self.insert_and_fire(&permit, message).await?;
        if dispose {
            self.lifecycle.dispose(&permit).await;
        }
        Ok(content)
    }

    async fn insert_and_fire(
        &self,
        permit: &InvocationPermit<'_>,
        message: &Message,
    ) -> HandlerResult<Option<Value>> {
        let session = self.lifecycle.get_or_create(permit).await?.session;
        let fact = self.bind_message(&session, message)?;
        let handle = session.insert(fact)?;
        let fired = session.fire_all_rules()?;
        debug!("Session {} fired {} rules", session.id(), fired);

        let evaluated = read_back(
            message,
            session.global(MESSAGE_GLOBAL)?,
            session.fact(handle)?,
        )?;
        Ok(evaluated.content)
    }

    async fn fire_until_halt(
        &self,
        message: &Message,
        entry_point: Option<&str>,
        dispose: bool,
    ) -> HandlerResult<Option<Value>> {
        let permit = self.lifecycle.acquire().await;
        self.insert_continuous(&permit, message, entry_point).await?;
        if dispose {
            self.lifecycle.dispose(&permit).await;
        }
        Ok(None)
    }

    async fn insert_continuous(
        &self,
        permit: &InvocationPermit<'_>,
        message: &Message,
        entry_point: Option<&str>,
    ) -> HandlerResult<()> {
        let session = self.lifecycle.get_or_create(permit).await?.session;
        let span = info_span!(parent: &self.span, "continuous_evaluation", session = %session.id());
        self.lifecycle.start_continuous(permit, span).await;

        let fact = self.bind_message(&session, message)?;
        match entry_point {
            Some(name) => {
                let entry = session
                    .entry_point(name)
                    .ok_or_else(|| HandlerError::UnknownEntryPoint {
                        entry_point: name.to_string(),
                    })?;
                entry.insert(fact)?;
            }
            None => {
                session.insert(fact)?;
            }
        }
        Ok(())
    }

    /// Binds the message globals and returns the fact to insert.
    fn bind_message(
        &self,
        session: &Arc<dyn StatefulSession>,
        message: &Message,
    ) -> HandlerResult<Value> {
        let fact = message.content.clone().unwrap_or(Value::Null);
        session.set_global(MESSAGE_GLOBAL, message_value(message)?)?;
        session.set_global(&self.config.message_content_name, fact.clone())?;
        Ok(fact)
    }
}

fn message_value(message: &Message) -> HandlerResult<Value> {
    serde_json::to_value(message).map_err(|e| HandlerError::MessageConversion(e.to_string()))
}

/// Rebuilds the message after evaluation.
///
/// `global` is the `message` global as the rules left it. `fact` is the
/// evaluated fact, `None` when it is no longer in working memory.
fn read_back(
    original: &Message,
    global: Option<Value>,
    fact: Option<Value>,
) -> HandlerResult<Message> {
    let mut message = match global {
        Some(value) => serde_json::from_value::<Message>(value)
            .map_err(|e| HandlerError::MessageConversion(e.to_string()))?,
        None => original.clone(),
    };
    if message.content == original.content {
        if let Some(fact) = fact {
            if !(original.content.is_none() && fact.is_null()) {
                message.content = Some(fact);
            }
        }
    }
    Ok(message)
}
