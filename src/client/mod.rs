//! Parameter client (subscriber role).
//!
//! One connection per client. Inbound value/lost frames surface through a
//! delegate; writes go out fire-and-forget and come back, if accepted, as
//! a later value broadcast. There is no transparent reconnect: the owner
//! hears `disconnected` exactly once and decides what to do.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionEvents};
use crate::discovery::ServiceInfo;
use crate::protocol::{Message, Value};

/// Event sink the presentation layer implements.
pub trait ClientDelegate: Send + Sync + 'static {
    /// Current or updated value for a shared name.
    fn received_value(&self, name: &str, value: Value);

    /// The name is no longer shared; discard any cached value.
    fn lost(&self, name: &str);

    /// The connection closed. Fired exactly once.
    fn disconnected(&self);
}

struct DelegateEvents {
    delegate: Arc<dyn ClientDelegate>,
}

impl ConnectionEvents for DelegateEvents {
    fn on_message(&self, _connection_id: Uuid, message: Message) {
        match message {
            Message::Value { name, value } => self.delegate.received_value(&name, value),
            Message::Lost { name } => self.delegate.lost(&name),
            Message::Set { name, .. } => {
                debug!(name = %name, "ignoring role-illegal set from server");
            }
        }
    }

    fn on_closed(&self, _connection_id: Uuid) {
        self.delegate.disconnected();
    }
}

/// Subscriber endpoint: one live link to a parameter server.
pub struct ParameterClient {
    connection: Connection,
}

impl ParameterClient {
    /// Connect to a server address and start dispatching events to the
    /// delegate.
    pub async fn connect(addr: SocketAddr, delegate: Arc<dyn ClientDelegate>) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to parameter server at {}", addr))?;

        let connection = Connection::new(stream);
        connection.start(Arc::new(DelegateEvents { delegate }));

        Ok(Self { connection })
    }

    /// Connect to a service found via discovery.
    pub async fn connect_service(
        service: &ServiceInfo,
        delegate: Arc<dyn ClientDelegate>,
    ) -> Result<Self> {
        Self::connect(service.addr(), delegate).await
    }

    /// Request a write to the value behind `name`. Fire-and-forget; the
    /// server drops requests for names it does not share.
    pub fn set_value(&self, value: Value, name: &str) -> bool {
        self.connection.send(Message::set(name, value))
    }

    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }

    /// Drop the link; the delegate hears `disconnected` once the
    /// connection tasks wind down.
    pub fn disconnect(&self) {
        self.connection.close();
    }
}

impl Drop for ParameterClient {
    fn drop(&mut self) {
        self.connection.close();
    }
}
