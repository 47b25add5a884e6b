//! Session registry: caller identity to live sessions.
//!
//! The control plane registers every authorized inbound transport here and
//! dials agents through it. A reconnect race can leave one identity with two
//! live sessions for a moment; dialing always uses the oldest, and removal
//! promotes the survivor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::connection::TunnelStream;
use crate::session::{Session, SessionConfig, SessionError};
use crate::transport::Transport;

/// Called after a session leaves the registry, with the caller identity and
/// the departed session key
pub type RemoveHook = Box<dyn Fn(&str, i64) + Send + Sync>;

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No live session for the requested identity
    #[error("no session found for {0}")]
    NoSession(String),

    /// The selected session refused the dial
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Maps caller identity to live sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: StdMutex<HashMap<String, Vec<Arc<Session>>>>,
    on_remove: StdMutex<Vec<RemoveHook>>,
}

impl SessionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook to run after every session removal
    pub fn on_remove(&self, hook: RemoveHook) {
        self.on_remove.lock().expect("hook list poisoned").push(hook);
    }

    /// Wrap an authorized transport in an acceptor session and register it
    /// under `client_key`. The caller still drives `serve` and must call
    /// [`remove`](Self::remove) when it returns.
    pub fn add(&self, client_key: &str, transport: Transport) -> Arc<Session> {
        let session = Session::new(SessionConfig::acceptor(client_key), transport);
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let entries = sessions.entry(client_key.to_string()).or_default();
        entries.push(session.clone());
        info!(
            client = client_key,
            session_key = session.session_key(),
            live = entries.len(),
            "session registered"
        );
        session
    }

    /// Drop a session from the registry and close it. Removal hooks fire
    /// after the entry is gone.
    pub fn remove(&self, session: &Arc<Session>) {
        let client_key = session.client_key().to_string();
        let session_key = session.session_key();
        let removed = {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            match sessions.get_mut(&client_key) {
                Some(entries) => {
                    let before = entries.len();
                    entries.retain(|s| s.session_key() != session_key);
                    let removed = entries.len() != before;
                    if entries.is_empty() {
                        sessions.remove(&client_key);
                    }
                    removed
                }
                None => false,
            }
        };
        if removed {
            session.close();
            info!(client = %client_key, session_key, "session removed");
            let hooks = self.on_remove.lock().expect("hook list poisoned");
            for hook in hooks.iter() {
                hook(&client_key, session_key);
            }
        }
    }

    /// Oldest live session for `client_key`
    pub fn get_by_client(&self, client_key: &str) -> Result<Arc<Session>, RegistryError> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        sessions
            .get(client_key)
            .and_then(|entries| entries.first())
            .cloned()
            .ok_or_else(|| RegistryError::NoSession(client_key.to_string()))
    }

    /// Whether any live session exists for `client_key`
    pub fn has_session(&self, client_key: &str) -> bool {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .contains_key(client_key)
    }

    /// Open a virtual connection through the identity's oldest session
    pub fn dial(
        &self,
        client_key: &str,
        deadline: Duration,
        proto: &str,
        address: &str,
    ) -> Result<TunnelStream, RegistryError> {
        let session = self.get_by_client(client_key)?;
        Ok(session.dial(proto, address, deadline)?)
    }

    /// A reusable dial handle bound to one identity and deadline
    pub fn dialer(self: &Arc<Self>, client_key: &str, deadline: Duration) -> Dialer {
        Dialer {
            registry: self.clone(),
            client_key: client_key.to_string(),
            deadline,
        }
    }
}

/// Dial handle bound to one caller identity; each call resolves the current
/// session, so it stays valid across agent reconnects
#[derive(Clone)]
pub struct Dialer {
    registry: Arc<SessionRegistry>,
    client_key: String,
    deadline: Duration,
}

impl Dialer {
    /// Open a virtual connection to `address` over `proto`
    pub fn dial(&self, proto: &str, address: &str) -> Result<TunnelStream, RegistryError> {
        self.registry
            .dial(&self.client_key, self.deadline, proto, address)
    }

    /// Identity this dialer resolves
    pub fn client_key(&self) -> &str {
        &self.client_key
    }
}
