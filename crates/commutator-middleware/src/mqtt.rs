//! [`MqttBroker`] – a [`BrokerClient`] backed by `rumqttc`.
//!
//! `rumqttc` splits a connection into an [`AsyncClient`] (request handle)
//! and an [`EventLoop`] that must be polled for anything to happen.  The
//! event loop runs on its own task which:
//!
//! - reports the first `CONNACK` (or connection error) back to
//!   [`MqttBroker::connect`];
//! - re-issues every known subscription after each `CONNACK`, so a
//!   reconnect restores command delivery;
//! - pushes incoming `PUBLISH` packets onto the bounded inbound queue with
//!   `try_send`, dropping (and logging) messages when the queue is full so
//!   keep-alive handling never waits on the dispatcher;
//! - tracks whether the session is up.  [`publish`][BrokerClient::publish]
//!   fails immediately while it is down and never waits for room in the
//!   request queue, so an outage loses messages instead of queueing them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use commutator_types::CommutatorError;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::broker::{BrokerClient, BrokerMessage, InboundSender};

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DRIVER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection parameters for [`MqttBroker`].
#[derive(Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// `(username, password)`.  The password is wiped when dropped.
    pub credentials: Option<(String, Zeroizing<String>)>,
}

impl MqttSettings {
    /// Settings for `host:port` with a random `commutator-…` client id.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: generate_client_id(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            credentials: None,
        }
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

impl fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("credentials", &self.credentials.as_ref().map(|(user, _)| (user, "[redacted]")))
            .finish()
    }
}

/// A fresh client identifier of the form `commutator-<uuid>`.
pub fn generate_client_id() -> String {
    format!("commutator-{}", Uuid::new_v4().simple())
}

/// Live MQTT session.
pub struct MqttBroker {
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MqttBroker {
    /// Connect and wait for the broker to acknowledge the session.
    ///
    /// Messages matching later subscriptions are delivered to `inbound`.
    ///
    /// # Errors
    ///
    /// * [`CommutatorError::Broker`] – the connection was refused or the
    ///   network failed before the first `CONNACK`.
    /// * [`CommutatorError::Timeout`] – no `CONNACK` within
    ///   `settings.connect_timeout`.
    pub async fn connect(settings: MqttSettings, inbound: InboundSender) -> Result<Self, CommutatorError> {
        let mut options = MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        options.set_keep_alive(settings.keep_alive.max(Duration::from_secs(1)));
        if let Some((username, password)) = &settings.credentials {
            options.set_credentials(username.as_str(), password.as_str());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let connected = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            Arc::clone(&subscriptions),
            Arc::clone(&connected),
            Arc::clone(&stopping),
            inbound,
            ready_tx,
        ));

        let handshake = match tokio::time::timeout(settings.connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommutatorError::Broker("event loop ended before connecting".to_string())),
            Err(_) => Err(CommutatorError::Timeout {
                operation: format!("connect to {}:{}", settings.host, settings.port),
                millis: u64::try_from(settings.connect_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };
        if let Err(e) = handshake {
            driver.abort();
            return Err(e);
        }

        info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "MQTT session established");
        Ok(Self {
            client,
            subscriptions,
            connected,
            stopping,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// `true` between a `CONNACK` and the next connection error.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    inbound: InboundSender,
    ready: oneshot::Sender<Result<(), CommutatorError>>,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!(code = ?ack.code, session_present = ack.session_present, "CONNACK received");
                connected.store(true, Ordering::SeqCst);
                let filters = lock(&subscriptions).clone();
                for filter in filters {
                    // Non-blocking: this task is the one draining the request queue.
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                        warn!(%filter, error = %e, "failed to restore subscription");
                    }
                }
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BrokerMessage::new(publish.topic.clone(), publish.payload.to_vec());
                match inbound.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        warn!(topic = %dropped.topic, "inbound queue full; dropping message");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("inbound queue closed; stopping MQTT event loop");
                        break;
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if stopping.load(Ordering::SeqCst) => break,
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(CommutatorError::Broker(e.to_string())));
                    break;
                }
                warn!(error = %e, "MQTT connection error; reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    debug!("MQTT event loop stopped");
}

fn broker_error(e: rumqttc::ClientError) -> CommutatorError {
    CommutatorError::Broker(e.to_string())
}

#[async_trait]
impl BrokerClient for MqttBroker {
    async fn subscribe(&self, filter: &str) -> Result<(), CommutatorError> {
        {
            let mut subscriptions = lock(&self.subscriptions);
            if !subscriptions.iter().any(|f| f == filter) {
                subscriptions.push(filter.to_string());
            }
        }
        // While disconnected the filter is issued by the next CONNACK.
        if self.is_connected() {
            self.client
                .try_subscribe(filter, QoS::AtMostOnce)
                .map_err(broker_error)?;
        }
        info!(%filter, "subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CommutatorError> {
        if !self.is_connected() {
            return Err(CommutatorError::Broker("not connected to broker".to_string()));
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(broker_error)
    }

    async fn disconnect(&self) -> Result<(), CommutatorError> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "disconnect request not sent");
        }

        let driver = lock(&self.driver).take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(DRIVER_STOP_TIMEOUT, &mut driver).await.is_err() {
                warn!("MQTT event loop did not stop in time; aborting");
                driver.abort();
            }
        }
        info!("MQTT session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::inbound_queue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNECT: u8 = 0x10;
    const SUBSCRIBE: u8 = 0x82;
    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// Read one MQTT packet: fixed header byte and body.
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.expect("packet header");
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.expect("remaining length");
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.expect("packet body");
        (header, body)
    }

    /// Accept a client, read its CONNECT and acknowledge it.
    async fn accept_session(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let (header, _) = read_packet(&mut stream).await;
        assert_eq!(header, CONNECT);
        stream.write_all(&CONNACK).await.expect("write CONNACK");
        stream
    }

    /// QoS 0 PUBLISH with a body short enough for a one-byte length.
    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&u16::try_from(topic.len()).unwrap().to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);
        let mut packet = vec![0x30, u8::try_from(body.len()).unwrap()];
        assert!(packet[1] < 0x80);
        packet.extend_from_slice(&body);
        packet
    }

    async fn local_listener() -> (TcpListener, MqttSettings) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let mut settings = MqttSettings::new("127.0.0.1", port);
        settings.connect_timeout = Duration::from_secs(5);
        (listener, settings)
    }

    fn contains(haystack: &[u8], needle: &str) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle.as_bytes())
    }

    #[test]
    fn debug_output_redacts_password() {
        let mut settings = MqttSettings::new("broker.local", 1883);
        settings.credentials = Some(("bridge".to_string(), Zeroizing::new("hunter2".to_string())));
        let debug = format!("{settings:?}");
        assert!(debug.contains("bridge"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn client_ids_are_unique_and_prefixed() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert!(a.starts_with("commutator-"));
        assert_ne!(a, b);
    }

    #[test]
    fn defaults_match_a_local_broker() {
        let settings = MqttSettings::default();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_fast() {
        let (tx, _rx) = inbound_queue(4);
        let mut settings = MqttSettings::new("127.0.0.1", 1);
        settings.connect_timeout = Duration::from_secs(5);

        let result = MqttBroker::connect(settings, tx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn incoming_publishes_reach_the_queue_and_overflow_is_dropped() {
        let (listener, settings) = local_listener().await;
        let (tx, mut rx) = inbound_queue(1);
        let server = tokio::spawn(async move {
            let mut stream = accept_session(&listener).await;
            for n in ["1", "2", "3"] {
                stream
                    .write_all(&publish_packet("c/devices/x/command", n.as_bytes()))
                    .await
                    .unwrap();
            }
            stream
        });

        let broker = MqttBroker::connect(settings, tx).await.expect("connected");
        assert!(broker.is_connected());
        let mut stream = server.await.unwrap();
        // Nobody drains the queue yet: "1" fills it, "2" and "3" are dropped.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.topic, "c/devices/x/command");
        assert_eq!(first.payload, b"1");

        stream.write_all(&publish_packet("c/devices/x/command", b"4")).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(next.payload, b"4");

        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn subscriptions_are_restored_after_reconnect() {
        let filter = "c/devices/+/command";
        let (listener, settings) = local_listener().await;
        let (tx, _rx) = inbound_queue(4);
        let server = tokio::spawn(async move {
            let mut first = accept_session(&listener).await;
            let (header, body) = read_packet(&mut first).await;
            assert_eq!(header, SUBSCRIBE);
            // SUBACK for the packet id so nothing is left pending.
            first.write_all(&[0x90, 0x03, body[0], body[1], 0x00]).await.unwrap();
            let first_body = body;
            drop(first);

            let mut second = accept_session(&listener).await;
            let (header, body) = read_packet(&mut second).await;
            assert_eq!(header, SUBSCRIBE);
            (first_body, body, second)
        });

        let broker = MqttBroker::connect(settings, tx).await.expect("connected");
        broker.subscribe(filter).await.unwrap();

        let (first, second, _stream) = tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("client reconnected and resubscribed")
            .unwrap();
        assert!(contains(&first, filter));
        assert!(contains(&second, filter));

        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn publish_fails_fast_while_the_broker_is_gone() {
        let (listener, settings) = local_listener().await;
        let (tx, _rx) = inbound_queue(4);
        let server = tokio::spawn(async move {
            let stream = accept_session(&listener).await;
            // Both the session and the listener go away.
            drop(stream);
            drop(listener);
        });

        let broker = MqttBroker::connect(settings, tx).await.expect("connected");
        server.await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("outage detected");

        // Well past the request queue capacity: none may block or be queued.
        for _ in 0..(REQUEST_CAPACITY * 3) {
            let result = tokio::time::timeout(
                Duration::from_secs(1),
                broker.publish("c/devices/x/data", b"23.5".to_vec()),
            )
            .await
            .expect("publish returned without waiting for the broker");
            assert!(matches!(result, Err(CommutatorError::Broker(_))));
        }

        tokio::time::timeout(Duration::from_secs(5), broker.disconnect())
            .await
            .expect("disconnect is bounded")
            .unwrap();
    }
}
