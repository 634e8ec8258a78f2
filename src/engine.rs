//! Session manager: the session map, the slot pool, and admission control.
//!
//! Admission inserts a Pending session and returns immediately; a background
//! supervision task waits for a slot (bounded), drives the sandbox start,
//! then parks on the session's done signal and evicts the record afterwards.
//! The slot is held for the whole container lifetime, so the number of
//! running sessions never exceeds the configured concurrency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::language::{ExecutionSpec, LanguageRegistry};
use crate::sandbox::{RunReport, Sandbox};
use crate::session::Session;

pub struct Engine {
    sandbox: Arc<dyn Sandbox>,
    registry: LanguageRegistry,
    config: EngineConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    slots: Arc<Semaphore>,
}

impl Engine {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        registry: LanguageRegistry,
        config: EngineConfig,
    ) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.max_concurrency));
        Arc::new(Self {
            sandbox,
            registry,
            config,
            sessions: RwLock::new(HashMap::new()),
            slots,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Admits a new session. Validation failures return before anything is
    /// created; on success the returned session is Pending and a background
    /// task owns the rest of its lifecycle.
    pub async fn start_session(
        self: &Arc<Self>,
        language: &str,
        code: &str,
    ) -> Result<Arc<Session>, EngineError> {
        let spec = self.registry.resolve(language)?.clone();
        if code.trim().is_empty() {
            return Err(EngineError::InvalidRequest("code must not be empty"));
        }

        let id = Uuid::new_v4().to_string();
        let session = Session::new_pending(id.clone(), language, code, &self.config);
        self.sessions
            .write()
            .await
            .insert(id.clone(), session.clone());
        info!(session = %id, language, "session admitted");

        tokio::spawn(supervise(self.clone(), session.clone(), spec));
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn list_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Non-interactive execution, bypassing the session map and slot pool.
    pub async fn execute(
        &self,
        language: &str,
        code: &str,
        time_limit: Duration,
    ) -> Result<RunReport, EngineError> {
        let spec = self.registry.resolve(language)?;
        if code.trim().is_empty() {
            return Err(EngineError::InvalidRequest("code must not be empty"));
        }
        Ok(self.sandbox.run_oneshot(spec, code, time_limit).await?)
    }

    /// Closes every live session; their watchers tear the containers down.
    pub async fn shutdown(&self) {
        let sessions = self.list_sessions().await;
        if !sessions.is_empty() {
            info!(count = sessions.len(), "closing live sessions");
        }
        for session in sessions {
            session.close();
        }
    }

    async fn evict(&self, id: &str) {
        self.sessions.write().await.remove(id);
        info!(session = %id, "session evicted");
    }
}

/// Per-session admission and supervision: slot, start, await completion,
/// evict. The permit drops on every exit path.
async fn supervise(engine: Arc<Engine>, session: Arc<Session>, spec: ExecutionSpec) {
    let acquire = engine.slots.clone().acquire_owned();
    let permit = match timeout(engine.config.slot_wait_timeout, acquire).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => {
            // Slot pool closed; the engine is going away.
            session.mark_terminated();
            engine.evict(session.id()).await;
            return;
        }
        Err(_) => {
            warn!(session = %session.id(), "timed out waiting for an execution slot");
            session.mark_terminated();
            engine.evict(session.id()).await;
            return;
        }
    };
    info!(session = %session.id(), "execution slot acquired");

    // Stopped while Pending: nothing to start.
    if !session.mark_starting() {
        engine.evict(session.id()).await;
        return;
    }
    let Some(code) = session.take_code() else {
        session.mark_terminated();
        engine.evict(session.id()).await;
        return;
    };

    match engine.sandbox.start_session(&session, &spec, &code).await {
        Ok(()) => {
            session.mark_running();
            session.done().await;
            info!(session = %session.id(), state = %session.state(), "session completed");
        }
        Err(err) => {
            error!(session = %session.id(), error = %err, "sandbox start failed");
            session.mark_terminated();
        }
    }
    engine.evict(session.id()).await;
    drop(permit);
}
