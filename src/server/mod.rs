//! Parameter server (publisher role).
//!
//! Owns the registry of shared key paths and the roster of connected
//! observers. Every registry edit and every observed value change fans
//! out to all workers; inbound set requests are applied to the observed
//! object, whose change notification then drives the rebroadcast (echo
//! back to the originator included, by design).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionEvents};
use crate::discovery::{self, Advertisement, DiscoveryConfig};
use crate::observe::{ChangeCallback, Observable};
use crate::protocol::{Message, Value};

/// One shared entry: a key path on an observed object, published under a
/// wire name. The server holds the object non-owningly.
struct KeyPathShare {
    key_path: String,
    object: Weak<dyn Observable>,
    /// Identity of this registration; a callback carrying a stale id
    /// (replaced or removed share) is dropped.
    share_id: Uuid,
    observation_token: Uuid,
}

struct ServerState {
    shares: HashMap<String, KeyPathShare>,
    workers: HashMap<Uuid, Connection>,
}

struct ServerInner {
    // Registry and roster share one lock so a share edit can never race a
    // broadcast into a partially updated worker list.
    state: Mutex<ServerState>,
    local_addr: SocketAddr,
}

/// Publisher endpoint: accepts observers, streams shared values, applies
/// writes.
pub struct ParameterServer {
    inner: Arc<ServerInner>,
    advertisement: Mutex<Option<Advertisement>>,
    accept_task: JoinHandle<()>,
}

impl ParameterServer {
    /// Bind the listener and start accepting observers. Port 0 picks an
    /// ephemeral port (used by tests).
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .context("failed to bind parameter server port")?;
        let local_addr = listener
            .local_addr()
            .context("failed to resolve listener address")?;

        let inner = Arc::new(ServerInner {
            state: Mutex::new(ServerState {
                shares: HashMap::new(),
                workers: HashMap::new(),
            }),
            local_addr,
        });

        let accept_task = tokio::spawn(accept_loop(listener, inner.clone()));

        Ok(Self {
            inner,
            advertisement: Mutex::new(None),
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Announce this server over discovery. Failure is logged and
    /// non-fatal: direct connections keep working, discovery just won't
    /// find us.
    pub async fn advertise(&self, config: &DiscoveryConfig, service_name: &str) {
        let metadata = HashMap::from([(
            "version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        )]);
        match discovery::advertise(config, service_name, self.inner.local_addr.port(), metadata)
            .await
        {
            Ok(handle) => {
                *self.advertisement.lock() = Some(handle);
            }
            Err(err) => {
                warn!(error = %err, "advertise failed; still accepting direct connections");
            }
        }
    }

    pub fn stop_advertising(&self) {
        if let Some(advertisement) = self.advertisement.lock().take() {
            advertisement.stop();
        }
    }

    /// Share `key_path` of `object` under `name`.
    ///
    /// Replaces any existing entry under the same name, cancelling the
    /// replaced entry's observation first. The current value is broadcast
    /// to every connected worker immediately; this call never waits on
    /// network I/O.
    pub fn share(&self, key_path: &str, object: Arc<dyn Observable>, name: &str) {
        let share_id = Uuid::new_v4();

        let callback: ChangeCallback = {
            let inner = Arc::downgrade(&self.inner);
            let name = name.to_string();
            Arc::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.broadcast_current(&name, share_id);
                }
            })
        };

        let previous = self.inner.state.lock().shares.remove(name);
        if let Some(previous) = previous {
            unobserve_share(&previous);
        }

        let observation_token = object.observe(key_path, callback);
        let current = object.get_value(key_path).unwrap_or(Value::Null);

        let share = KeyPathShare {
            key_path: key_path.to_string(),
            object: Arc::downgrade(&object),
            share_id,
            observation_token,
        };

        {
            let mut state = self.inner.state.lock();
            state.shares.insert(name.to_string(), share);
            for worker in state.workers.values() {
                worker.send(Message::value(name, current.clone()));
            }
        }

        info!(name = %name, key_path = %key_path, "sharing key path");
    }

    /// Stop sharing `name`. The key path and object must match the
    /// current registration (a mismatch is a logged no-op); stopping an
    /// absent share is a silent no-op.
    ///
    /// The observation is cancelled before this returns: no change
    /// callback for this name fires afterwards.
    pub fn stop_sharing(&self, key_path: &str, object: Arc<dyn Observable>, name: &str) {
        let removed = {
            let mut state = self.inner.state.lock();
            let matches = state.shares.get(name).map(|share| {
                share.key_path == key_path
                    && Weak::ptr_eq(&share.object, &Arc::downgrade(&object))
            });
            match matches {
                Some(true) => state.shares.remove(name),
                Some(false) => {
                    warn!(name = %name, "stop_sharing target does not match current share");
                    None
                }
                None => None,
            }
        };

        let Some(share) = removed else {
            return;
        };

        unobserve_share(&share);
        self.inner.broadcast(Message::lost(name));
        info!(name = %name, "stopped sharing key path");
    }

    /// Names currently shared, in no particular order.
    pub fn shared_names(&self) -> Vec<String> {
        self.inner.state.lock().shares.keys().cloned().collect()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().workers.len()
    }
}

impl Drop for ParameterServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let workers: Vec<Connection> = self
            .inner
            .state
            .lock()
            .workers
            .values()
            .cloned()
            .collect();
        for worker in workers {
            worker.close();
        }
    }
}

fn unobserve_share(share: &KeyPathShare) {
    if let Some(object) = share.object.upgrade() {
        object.unobserve(share.observation_token);
    }
}

impl ServerInner {
    /// Re-read and broadcast the current value for `name`, provided the
    /// registration that scheduled this callback is still the live one.
    fn broadcast_current(&self, name: &str, share_id: Uuid) {
        let target = {
            let state = self.state.lock();
            match state.shares.get(name) {
                Some(share) if share.share_id == share_id => {
                    (share.object.clone(), share.key_path.clone())
                }
                // Concurrently removed or replaced: the observation is
                // stale, drop silently.
                _ => return,
            }
        };

        let Some(object) = target.0.upgrade() else {
            debug!(name = %name, "observed object dropped, skipping broadcast");
            return;
        };
        let value = object.get_value(&target.1).unwrap_or(Value::Null);

        self.broadcast(Message::value(name, value));
    }

    fn broadcast(&self, message: Message) {
        let state = self.state.lock();
        for worker in state.workers.values() {
            worker.send(message.clone());
        }
    }
}

impl ConnectionEvents for ServerInner {
    fn on_message(&self, connection_id: Uuid, message: Message) {
        match message {
            Message::Set { name, value } => {
                let target = {
                    let state = self.state.lock();
                    state
                        .shares
                        .get(&name)
                        .map(|share| (share.object.clone(), share.key_path.clone()))
                };

                let Some((object, key_path)) = target else {
                    debug!(name = %name, "set for name that is not shared, dropping");
                    return;
                };
                let Some(object) = object.upgrade() else {
                    debug!(name = %name, "set for name whose object is gone, dropping");
                    return;
                };

                // Writing through the observed object fires the standard
                // change callback, which rebroadcasts to every worker,
                // the originator included.
                if let Err(err) = object.set_value(&key_path, value) {
                    warn!(name = %name, error = %err, "failed to apply set");
                }
            }
            other => {
                debug!(
                    connection = %connection_id,
                    name = %other.name(),
                    "ignoring role-illegal message from observer"
                );
            }
        }
    }

    fn on_closed(&self, connection_id: Uuid) {
        let removed = self.state.lock().workers.remove(&connection_id);
        if removed.is_some() {
            info!(connection = %connection_id, "observer disconnected");
        }
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<ServerInner>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let connection = Connection::new(stream);
                info!(peer = %peer_addr, connection = %connection.id(), "observer connected");

                // Register before starting the connection tasks so the
                // closed event cannot race the roster insertion. Late
                // joiners get the current value of every share.
                {
                    let mut state = inner.state.lock();
                    for (name, share) in &state.shares {
                        let value = share
                            .object
                            .upgrade()
                            .and_then(|object| object.get_value(&share.key_path))
                            .unwrap_or(Value::Null);
                        connection.send(Message::value(name.clone(), value));
                    }
                    state.workers.insert(connection.id(), connection.clone());
                }

                connection.start(inner.clone());
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
