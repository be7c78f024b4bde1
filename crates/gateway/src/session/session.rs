//! Session state for one client connection.
//!
//! A session is created on SSE handshake and owns the write side of the
//! stream. In-flight call ids are tracked so responses can be correlated
//! and duplicate ids rejected; disconnect abandons everything in flight.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::rpc::{JsonRpcId, JsonRpcResponse};

/// One active client connection.
pub struct Session {
    pub session_id: Uuid,
    /// Scope bound at handshake from the connection path.
    pub scope: String,
    /// Authorization context resolved once at handshake.
    pub ctx: AuthContext,
    sender: mpsc::Sender<JsonRpcResponse>,
    in_flight: Mutex<HashSet<JsonRpcId>>,
    oversize_strikes: AtomicU32,
}

impl Session {
    pub fn new(scope: String, ctx: AuthContext, sender: mpsc::Sender<JsonRpcResponse>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            scope,
            ctx,
            sender,
            in_flight: Mutex::new(HashSet::new()),
            oversize_strikes: AtomicU32::new(0),
        }
    }

    /// Write one correlated response frame to the client stream.
    ///
    /// Fails only when the client is gone; the caller drops the response,
    /// which is the abandon-on-disconnect behavior.
    pub async fn send(&self, response: JsonRpcResponse) -> Result<(), ()> {
        self.sender.send(response).await.map_err(|_| ())
    }

    /// Register a call id. Returns false when the id is already in flight.
    pub async fn begin_call(&self, id: &JsonRpcId) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.insert(id.clone())
    }

    /// Release a call id after its terminal response is written.
    pub async fn end_call(&self, id: &JsonRpcId) {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.remove(id);
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Count one oversized frame and return the running total.
    pub fn oversize_strike(&self) -> u32 {
        self.oversize_strikes.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// All live sessions, keyed by session id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id, Arc::clone(&session));
        tracing::info!(
            session_id = %session.session_id,
            scope = %session.scope,
            user_id = %session.ctx.user_id,
            active = sessions.len(),
            "Session opened"
        );
        session
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    /// Drop a session; in-flight calls are abandoned, not retried.
    pub async fn remove(&self, session_id: &Uuid) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(session_id).is_some() {
            tracing::info!(
                session_id = %session_id,
                active = sessions.len(),
                "Session closed"
            );
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
