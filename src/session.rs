//! # Session Lifecycle
//!
//! Owns the single stateful session slot of a handler and the continuous
//! evaluation worker bound to it.
//!
//! ```text
//! Absent ──get_or_create──▶ Creating ──▶ Live ──dispose──▶ Disposing ──▶ Absent
//!    ▲                          │
//!    └──────── failure ─────────┘
//! ```
//!
//! ## Locks
//!
//! Two locks guard the slot:
//!
//! - the invocation lock serializes evaluation bodies that touch the shared
//!   session; holding it yields an [`InvocationPermit`]
//! - the lifecycle lock (the slot mutex) serializes creation and disposal
//!
//! Every transition takes `&InvocationPermit`, so a transition can only run
//! after the caller has acquired the invocation lock. Disposal therefore never
//! overlaps an in-flight evaluation, and the acquisition order is always
//! invocation first, lifecycle second.
//!
//! Once [`SessionLifecycle::close`] has run, no session is created again.
//! Dropping the lifecycle halts and disposes a session still in the slot.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use tokio::{
    sync::{Mutex, MutexGuard, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

use crate::audit::{open_audit_log, AuditLog};
use crate::binding::EngineBinding;
use crate::channel::{bind_references, Channel};
use crate::config::{AuditConfig, RulesComponentConfig};
use crate::engine::{EngineEventListener, StatefulSession};
use crate::error::{HandlerError, HandlerResult};
use crate::exchange::ReferenceTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionPhase {
    Absent,
    Creating,
    Live,
    Disposing,
}

/// Proof that the holder owns the invocation lock.
pub struct InvocationPermit<'a> {
    _guard: MutexGuard<'a, ()>,
    lock: &'a Mutex<()>,
}

impl InvocationPermit<'_> {
    fn is_for(&self, lock: &Mutex<()>) -> bool {
        std::ptr::eq(self.lock, lock)
    }
}

pub struct SessionHandle {
    pub session: Arc<dyn StatefulSession>,
    /// True when this call created the session.
    pub created: bool,
}

struct LiveSession {
    session: Arc<dyn StatefulSession>,
    audit: Option<Arc<AuditLog>>,
    worker: Option<JoinHandle<()>>,
}

impl LiveSession {
    fn worker_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false)
    }

    /// Halts and disposes without waiting for the worker.
    fn release_now(self) {
        self.session.halt();
        self.session.dispose();
        if let Some(audit) = self.audit {
            audit.close();
        }
    }
}

pub struct SessionLifecycle {
    binding: Arc<EngineBinding>,
    channels: Vec<Arc<dyn Channel>>,
    audit: Option<AuditConfig>,
    namespace: String,
    references: ReferenceTable,
    invocation: Mutex<()>,
    slot: Mutex<Option<LiveSession>>,
    phase: RwLock<SessionPhase>,
    created: AtomicU64,
    closed: AtomicBool,
}

impl SessionLifecycle {
    pub fn new(
        binding: Arc<EngineBinding>,
        config: &RulesComponentConfig,
        channels: Vec<Arc<dyn Channel>>,
        references: ReferenceTable,
    ) -> Self {
        Self {
            binding,
            channels,
            audit: config.audit.clone(),
            namespace: config.target_namespace.clone(),
            references,
            invocation: Mutex::new(()),
            slot: Mutex::new(None),
            phase: RwLock::new(SessionPhase::Absent),
            created: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Waits for the invocation lock. The lock is released when the permit drops.
    pub async fn acquire(&self) -> InvocationPermit<'_> {
        InvocationPermit {
            _guard: self.invocation.lock().await,
            lock: &self.invocation,
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        *self.phase.read().await
    }

    async fn set_phase(&self, phase: SessionPhase) {
        let mut current = self.phase.write().await;
        debug!("Session phase: {} -> {}", *current, phase);
        *current = phase;
    }

    /// Number of stateful sessions created over the lifetime of this manager.
    pub fn sessions_created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn session_id(&self) -> Option<String> {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|live| live.session.id().to_string())
    }

    pub async fn worker_running(&self) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(LiveSession::worker_running)
            .unwrap_or(false)
    }

    fn check_permit(&self, permit: &InvocationPermit<'_>) {
        debug_assert!(
            permit.is_for(&self.invocation),
            "permit belongs to another session lifecycle"
        );
    }

    /// Returns the live session, creating it first when the slot is empty.
    #[instrument(skip_all)]
    pub async fn get_or_create(
        &self,
        permit: &InvocationPermit<'_>,
    ) -> HandlerResult<SessionHandle> {
        self.check_permit(permit);
        let mut slot = self.slot.lock().await;
        if self.is_closed() {
            return Err(HandlerError::NotInitialized);
        }
        if let Some(live) = slot.as_ref() {
            return Ok(SessionHandle {
                session: live.session.clone(),
                created: false,
            });
        }

        self.set_phase(SessionPhase::Creating).await;
        match self.create_session().await {
            Ok(live) => {
                let session = live.session.clone();
                *slot = Some(live);
                self.created.fetch_add(1, Ordering::SeqCst);
                self.set_phase(SessionPhase::Live).await;
                info!("Stateful session created: {}", session.id());
                Ok(SessionHandle {
                    session,
                    created: true,
                })
            }
            Err(e) => {
                self.set_phase(SessionPhase::Absent).await;
                warn!("Stateful session creation failed: {}", e);
                Err(e)
            }
        }
    }

    async fn create_session(&self) -> HandlerResult<LiveSession> {
        let session = self.binding.new_stateful_session().await;
        let wired = self.wire(&session);
        match wired {
            Ok(audit) => Ok(LiveSession {
                session,
                audit,
                worker: None,
            }),
            Err(e) => {
                session.dispose();
                Err(e)
            }
        }
    }

    fn wire(&self, session: &Arc<dyn StatefulSession>) -> HandlerResult<Option<Arc<AuditLog>>> {
        let audit = open_audit_log(self.audit.as_ref(), session.id())?;
        if let Some(audit) = &audit {
            session.add_listener(audit.clone() as Arc<dyn EngineEventListener>)?;
        }
        bind_references(&self.channels, &self.namespace, &self.references);
        for channel in &self.channels {
            session.register_channel(channel.name(), channel.clone())?;
        }
        Ok(audit)
    }

    /// Starts the continuous worker for the live session unless one is running.
    ///
    /// Returns whether a worker was started.
    pub async fn start_continuous(&self, permit: &InvocationPermit<'_>, span: Span) -> bool {
        self.check_permit(permit);
        let mut slot = self.slot.lock().await;
        if self.is_closed() {
            return false;
        }
        let Some(live) = slot.as_mut() else {
            return false;
        };
        if live.worker_running() {
            return false;
        }

        let session = live.session.clone();
        let session_id = session.id().to_string();
        live.worker = Some(tokio::spawn(
            async move {
                if let Err(e) = session.fire_until_halt().await {
                    error!("Continuous evaluation failed: {}", e);
                }
            }
            .instrument(span),
        ));
        info!("Continuous worker started for session {}", session_id);
        true
    }

    /// Halts the worker, waits for it, then releases the session. No-op when absent.
    #[instrument(skip_all)]
    pub async fn dispose(&self, permit: &InvocationPermit<'_>) {
        self.check_permit(permit);
        let mut slot = self.slot.lock().await;
        self.release(&mut slot).await;
    }

    /// Disposes the session and refuses to create another one.
    #[instrument(skip_all)]
    pub async fn close(&self, permit: &InvocationPermit<'_>) {
        self.check_permit(permit);
        let mut slot = self.slot.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        self.release(&mut slot).await;
        debug!("Session lifecycle closed");
    }

    async fn release(&self, slot: &mut Option<LiveSession>) {
        let Some(live) = slot.take() else {
            return;
        };
        self.set_phase(SessionPhase::Disposing).await;

        let session_id = live.session.id().to_string();
        live.session.halt();
        if let Some(worker) = live.worker {
            if let Err(e) = worker.await {
                warn!("Continuous worker for {} ended abnormally: {}", session_id, e);
            }
        }
        live.session.dispose();
        if let Some(audit) = live.audit {
            audit.close();
        }

        self.set_phase(SessionPhase::Absent).await;
        info!("Stateful session disposed: {}", session_id);
    }
}

impl Drop for SessionLifecycle {
    fn drop(&mut self) {
        if let Some(live) = self.slot.get_mut().take() {
            warn!(
                "Session lifecycle dropped with live session {}",
                live.session.id()
            );
            live.release_now();
        }
    }
}
