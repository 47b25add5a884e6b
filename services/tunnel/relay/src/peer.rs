//! Replica peer tracking.
//!
//! Membership arrives as `(ip, present)` observations from an external
//! endpoint watch. The manager diffs each observation against its current
//! snapshot and keeps only the live peer table; no history is retained.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use tracing::info;

/// One known replica peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Stable peer identifier (the observed address)
    pub id: String,
    /// Tunnel endpoint URL for relay hops to this peer
    pub url: String,
    /// Shared inter-replica credential presented on relay handshakes
    pub token: String,
}

/// Change emitted when the peer table is mutated
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Peer entered the table
    Added(Peer),
    /// Peer left the table, by id
    Removed(String),
}

type ChangeHook = Box<dyn Fn(&PeerEvent) + Send + Sync>;

/// Tracks the control-plane replica set
pub struct PeerManager {
    token: String,
    url_for: Box<dyn Fn(&str) -> String + Send + Sync>,
    peers: StdMutex<HashMap<String, Peer>>,
    on_change: StdMutex<Vec<ChangeHook>>,
}

impl PeerManager {
    /// New manager. `token` is the shared inter-replica credential and
    /// `url_for` builds a peer's tunnel URL from its observed address.
    pub fn new(
        token: &str,
        url_for: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            token: token.to_string(),
            url_for: Box::new(url_for),
            peers: StdMutex::new(HashMap::new()),
            on_change: StdMutex::new(Vec::new()),
        }
    }

    /// Register a hook called on every peer add/remove
    pub fn on_change(&self, hook: impl Fn(&PeerEvent) + Send + Sync + 'static) {
        self.on_change
            .lock()
            .expect("hook list poisoned")
            .push(Box::new(hook));
    }

    /// Shared inter-replica credential; inbound relay handshakes are checked
    /// against it
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether `token` matches the inter-replica credential
    pub fn token_matches(&self, token: &str) -> bool {
        !self.token.is_empty() && self.token == token
    }

    /// Add a relay target
    pub fn add_peer(&self, url: &str, id: &str, token: &str) {
        let peer = Peer {
            id: id.to_string(),
            url: url.to_string(),
            token: token.to_string(),
        };
        let changed = {
            let mut peers = self.peers.lock().expect("peer table poisoned");
            peers.insert(id.to_string(), peer.clone()) != Some(peer.clone())
        };
        if changed {
            info!(peer = id, url, "peer added");
            self.emit(PeerEvent::Added(peer));
        }
    }

    /// Remove a relay target by id
    pub fn remove_peer(&self, id: &str) {
        let removed = {
            let mut peers = self.peers.lock().expect("peer table poisoned");
            peers.remove(id).is_some()
        };
        if removed {
            info!(peer = id, "peer removed");
            self.emit(PeerEvent::Removed(id.to_string()));
        }
    }

    /// Apply one membership observation batch: peers observed present are
    /// added, peers observed absent are dropped, peers not mentioned keep
    /// their current state.
    pub fn observe<I>(&self, observations: I)
    where
        I: IntoIterator<Item = (String, bool)>,
    {
        for (ip, present) in observations {
            let known = self
                .peers
                .lock()
                .expect("peer table poisoned")
                .contains_key(&ip);
            match (known, present) {
                (false, true) => {
                    let url = (self.url_for)(&ip);
                    self.add_peer(&url, &ip, &self.token);
                }
                (true, false) => self.remove_peer(&ip),
                _ => {}
            }
        }
    }

    /// Look up a peer by id
    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers
            .lock()
            .expect("peer table poisoned")
            .get(id)
            .cloned()
    }

    /// Snapshot of the current peer table
    pub fn peers(&self) -> Vec<Peer> {
        self.peers
            .lock()
            .expect("peer table poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn emit(&self, event: PeerEvent) {
        let hooks = self.on_change.lock().expect("hook list poisoned");
        for hook in hooks.iter() {
            hook(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn manager_with_log() -> (Arc<PeerManager>, Arc<Mutex<Vec<String>>>) {
        let manager = Arc::new(PeerManager::new("s3cret", |ip| {
            format!("wss://{ip}/connect/proxy")
        }));
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        manager.on_change(move |event| {
            let line = match event {
                PeerEvent::Added(p) => format!("+{}", p.id),
                PeerEvent::Removed(id) => format!("-{id}"),
            };
            sink.lock().unwrap().push(line);
        });
        (manager, log)
    }

    #[test]
    fn test_observe_diffs_against_snapshot() {
        let (manager, log) = manager_with_log();

        manager.observe([("10.0.0.1".to_string(), true), ("10.0.0.2".to_string(), true)]);
        assert_eq!(manager.peers().len(), 2);
        assert_eq!(
            manager.get("10.0.0.1").unwrap().url,
            "wss://10.0.0.1/connect/proxy"
        );

        // repeat observation is a no-op
        manager.observe([("10.0.0.1".to_string(), true)]);
        // departure removes
        manager.observe([("10.0.0.2".to_string(), false)]);
        assert!(manager.get("10.0.0.2").is_none());

        let log = log.lock().unwrap();
        assert_eq!(*log, vec!["+10.0.0.1", "+10.0.0.2", "-10.0.0.2"]);
    }

    #[test]
    fn test_remove_unknown_peer_is_silent() {
        let (manager, log) = manager_with_log();
        manager.remove_peer("ghost");
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_token_match() {
        let (manager, _log) = manager_with_log();
        assert!(manager.token_matches("s3cret"));
        assert!(!manager.token_matches("wrong"));
        assert!(!manager.token_matches(""));
    }
}
