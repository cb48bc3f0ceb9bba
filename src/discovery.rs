//! LAN service discovery.
//!
//! Publishers announce themselves with periodic UDP beacons; browsers
//! listen on the shared discovery port and turn beacons into found/removed
//! events. Neither the server nor the client touches the UDP transport
//! directly, so the beacon scheme can be swapped without touching the
//! protocol core.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, warn};

use crate::protocol::{DISCOVERY_PORT, SERVICE_TYPE};

/// How often alive beacons are sent by default.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(2);

/// Discovery transport configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Address beacons are sent to. Defaults to IPv4 broadcast on the
    /// shared discovery port; tests point it at loopback.
    pub beacon_target: SocketAddr,

    /// Address the browser binds to receive beacons.
    pub listen_addr: SocketAddr,

    /// Beacon cadence. Services missing three consecutive beacons (plus
    /// grace) are treated as removed.
    pub interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            beacon_target: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DISCOVERY_PORT),
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DISCOVERY_PORT),
            interval: BEACON_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Beacon {
    service: String,
    name: String,
    port: u16,
    event: BeaconEvent,
    #[serde(default)]
    metadata: HashMap<String, String>,
    sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BeaconEvent {
    Alive,
    Bye,
}

/// A discovered publisher, resolved to a connectable host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub service: String,
    pub host: IpAddr,
    pub port: u16,
    pub metadata: HashMap<String, String>,
}

impl ServiceInfo {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub enum BrowseEvent {
    Found(ServiceInfo),
    Removed(String),
}

/// Active advertisement. Stopping (or dropping) sends a final bye beacon.
pub struct Advertisement {
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Advertisement {
    pub fn stop(mut self) {
        self.signal_stop();
    }

    fn signal_stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

/// Start advertising a service instance.
///
/// Bind or send failures after startup are logged and retried on the next
/// tick; they never affect the advertising process beyond discovery.
pub async fn advertise(
    config: &DiscoveryConfig,
    service_name: &str,
    port: u16,
    metadata: HashMap<String, String>,
) -> Result<Advertisement> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("advertise: failed to bind beacon socket")?;
    socket
        .set_broadcast(true)
        .context("advertise: failed to enable broadcast")?;

    let target = config.beacon_target;
    let name = service_name.to_string();
    let beacon_interval = config.interval;
    let (stop_tx, mut stop_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut ticker = interval(beacon_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let beacon = Beacon {
                        service: SERVICE_TYPE.to_string(),
                        name: name.clone(),
                        port,
                        event: BeaconEvent::Alive,
                        metadata: metadata.clone(),
                        sent_at: Utc::now(),
                    };
                    if let Err(err) = send_beacon(&socket, target, &beacon).await {
                        warn!(error = %err, "beacon send failed");
                    }
                }
                _ = &mut stop_rx => {
                    let beacon = Beacon {
                        service: SERVICE_TYPE.to_string(),
                        name: name.clone(),
                        port,
                        event: BeaconEvent::Bye,
                        metadata: HashMap::new(),
                        sent_at: Utc::now(),
                    };
                    if let Err(err) = send_beacon(&socket, target, &beacon).await {
                        debug!(error = %err, "bye beacon send failed");
                    }
                    break;
                }
            }
        }
    });

    Ok(Advertisement {
        stop_tx: Some(stop_tx),
    })
}

async fn send_beacon(socket: &UdpSocket, target: SocketAddr, beacon: &Beacon) -> Result<()> {
    let payload = serde_json::to_vec(beacon)?;
    socket
        .send_to(&payload, target)
        .await
        .context("beacon send failed")?;
    Ok(())
}

/// Long-lived browse stream; lives until dropped.
pub struct Browser {
    events: mpsc::UnboundedReceiver<BrowseEvent>,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Browser {
    pub async fn recv(&mut self) -> Option<BrowseEvent> {
        self.events.recv().await
    }

    /// Address the browser is listening on (ephemeral in tests).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Browse for advertised publishers.
pub async fn browse(config: &DiscoveryConfig) -> Result<Browser> {
    let socket = UdpSocket::bind(config.listen_addr)
        .await
        .context("browse: failed to bind discovery port")?;
    let local_addr = socket
        .local_addr()
        .context("browse: failed to resolve local address")?;

    let (tx, rx) = mpsc::unbounded_channel();
    let expiry = config.interval * 3 + Duration::from_millis(500);

    let task = tokio::spawn(async move {
        let mut seen: HashMap<String, (ServiceInfo, Instant)> = HashMap::new();
        let mut buf = [0u8; 2048];
        let mut sweep = interval(Duration::from_millis(200));

        loop {
            tokio::select! {
                recv = socket.recv_from(&mut buf) => {
                    let (n, from) = match recv {
                        Ok(received) => received,
                        Err(err) => {
                            warn!(error = %err, "discovery recv failed");
                            break;
                        }
                    };

                    let beacon: Beacon = match serde_json::from_slice(&buf[..n]) {
                        Ok(beacon) => beacon,
                        Err(err) => {
                            debug!(error = %err, "ignoring undecodable beacon");
                            continue;
                        }
                    };
                    if beacon.service != SERVICE_TYPE {
                        continue;
                    }

                    match beacon.event {
                        BeaconEvent::Alive => {
                            let info = ServiceInfo {
                                name: beacon.name.clone(),
                                service: beacon.service,
                                host: from.ip(),
                                port: beacon.port,
                                metadata: beacon.metadata,
                            };
                            let changed = match seen.insert(
                                beacon.name,
                                (info.clone(), Instant::now()),
                            ) {
                                Some((previous, _)) => previous != info,
                                None => true,
                            };
                            if changed && tx.send(BrowseEvent::Found(info)).is_err() {
                                break;
                            }
                        }
                        BeaconEvent::Bye => {
                            if seen.remove(&beacon.name).is_some()
                                && tx.send(BrowseEvent::Removed(beacon.name)).is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    let expired: Vec<String> = seen
                        .iter()
                        .filter(|(_, (_, last_seen))| now.duration_since(*last_seen) > expiry)
                        .map(|(name, _)| name.clone())
                        .collect();
                    for name in expired {
                        seen.remove(&name);
                        if tx.send(BrowseEvent::Removed(name)).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    Ok(Browser {
        events: rx,
        local_addr,
        task,
    })
}
