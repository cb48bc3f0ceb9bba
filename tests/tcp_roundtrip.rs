use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dx_tune::{
    ClientDelegate, Observable, ParamStore, ParameterClient, ParameterServer, Value,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, PartialEq)]
enum Event {
    Value(String, Value),
    Lost(String),
    Disconnected,
}

struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl ClientDelegate for Recorder {
    fn received_value(&self, name: &str, value: Value) {
        let _ = self.tx.send(Event::Value(name.to_string(), value));
    }

    fn lost(&self, name: &str) {
        let _ = self.tx.send(Event::Lost(name.to_string()));
    }

    fn disconnected(&self) {
        let _ = self.tx.send(Event::Disconnected);
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel open")
}

fn loopback(server: &ParameterServer) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connecting_observer_receives_current_value() {
    let server = ParameterServer::bind(0).await.unwrap();
    let store = Arc::new(ParamStore::new().with_value("gain", Value::Float(0.5)));
    server.share("gain", store.clone(), "mixer.gain");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _client = ParameterClient::connect(loopback(&server), Arc::new(Recorder { tx }))
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut rx).await,
        Event::Value("mixer.gain".to_string(), Value::Float(0.5))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_updates_store_and_echoes_to_originator() {
    let server = ParameterServer::bind(0).await.unwrap();
    let store = Arc::new(ParamStore::new().with_value("gain", Value::Float(0.5)));
    server.share("gain", store.clone(), "mixer.gain");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = ParameterClient::connect(loopback(&server), Arc::new(Recorder { tx }))
        .await
        .unwrap();

    // Snapshot first, so the worker is registered before we write.
    assert_eq!(
        next_event(&mut rx).await,
        Event::Value("mixer.gain".to_string(), Value::Float(0.5))
    );

    assert!(client.set_value(Value::Float(0.75), "mixer.gain"));

    // No echo suppression: the originator gets the rebroadcast too.
    assert_eq!(
        next_event(&mut rx).await,
        Event::Value("mixer.gain".to_string(), Value::Float(0.75))
    );
    assert_eq!(store.get_value("gain"), Some(Value::Float(0.75)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_change_after_share_reaches_observer() {
    let server = ParameterServer::bind(0).await.unwrap();
    let store = Arc::new(ParamStore::new().with_value("label", Value::Text("a".to_string())));
    server.share("label", store.clone(), "mixer.label");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _client = ParameterClient::connect(loopback(&server), Arc::new(Recorder { tx }))
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut rx).await,
        Event::Value("mixer.label".to_string(), Value::Text("a".to_string()))
    );

    store
        .set_value("label", Value::Text("b".to_string()))
        .unwrap();

    assert_eq!(
        next_event(&mut rx).await,
        Event::Value("mixer.label".to_string(), Value::Text("b".to_string()))
    );
}
