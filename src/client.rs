//! HMQ client — the broker's peer library
//!
//! Owns one TCP connection: a reader task that correlates inbound
//! frames (acks, responses, pulls, queue streams, consumer descriptors,
//! events), a writer task fed by an mpsc channel, and a heartbeat task
//! that pings on an interval. Producer pushes can await the broker's
//! acknowledge; requests correlate with their `Response` frame by
//! message id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{self, content_types, FrameReader, FrameWriter};
use crate::error::{HmqError, Result};
use crate::message::{Message, MessageType};
use crate::options::{PushResult, QueueOptions};

/// Client connection options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub name: String,
    pub client_type: String,
    /// Requested client id; the broker assigns one when empty
    pub id: Option<String>,
    pub ping_interval_ms: u64,
    /// How long pushes wait for the broker's acknowledge
    pub ack_timeout_ms: u64,
    /// How long requests wait for their response
    pub response_timeout_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: "client".to_string(),
            client_type: String::new(),
            id: None,
            ping_interval_ms: 10_000,
            ack_timeout_ms: 30_000,
            response_timeout_ms: 30_000,
        }
    }
}

/// Handler invoked for messages matching a registered descriptor
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn consume(&self, message: Message) -> Result<()>;
}

/// Registration entry for message consumption
///
/// A lookup by payload shape — `(target, content type)` — yields at most
/// one descriptor. With `auto_ack` the client acknowledges on behalf of
/// the handler: positive on `Ok`, negative on `Err`.
pub struct ConsumerDescriptor {
    pub target: String,
    pub content_type: u16,
    pub auto_ack: bool,
    pub handler: Arc<dyn MessageConsumer>,
}

type EventCallback = Arc<dyn Fn(Message) + Send + Sync>;

struct ClientShared {
    id: String,
    options: ClientOptions,
    out_tx: mpsc::Sender<Bytes>,
    /// Pushes and control ops awaiting an Acknowledge, by message id
    pending_acks: Mutex<HashMap<String, oneshot::Sender<PushResult>>>,
    /// Requests (and list queries) awaiting a reply frame, by message id
    pending_responses: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    /// Outstanding pulls, by queue name
    pending_pulls: Mutex<HashMap<String, oneshot::Sender<Result<Option<Message>>>>>,
    /// Pull request id → queue name, to resolve Empty nacks
    pull_requests: Mutex<HashMap<String, String>>,
    /// (target, content type) → descriptor
    consumers: Mutex<HashMap<(String, u16), Arc<ConsumerDescriptor>>>,
    /// Queue name → subscription stream
    queue_streams: Mutex<HashMap<String, mpsc::Sender<Message>>>,
    /// (event name, target key) → callbacks in registration order
    event_handlers: Mutex<HashMap<(String, String), Vec<EventCallback>>>,
}

impl ClientShared {
    async fn send(&self, message: &Message) -> Result<()> {
        let bytes = codec::encode(message)?;
        self.out_tx
            .send(bytes)
            .await
            .map_err(|_| HmqError::NotConnected)
    }
}

/// A connected HMQ client
pub struct HmqClient {
    shared: Arc<ClientShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl HmqClient {
    /// Connect and handshake
    pub async fn connect(addr: &str, options: ClientOptions) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| HmqError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        writer.write_bytes(codec::HANDSHAKE_MAGIC).await?;

        let mut hello = Message::new(MessageType::Server);
        hello.content_type = content_types::HELLO;
        let mut content = String::from("CONNECT /\r\n");
        content.push_str(&format!("Name: {}\r\n", options.name));
        content.push_str(&format!("Type: {}\r\n", options.client_type));
        if let Some(id) = &options.id {
            content.push_str(&format!("Id: {}\r\n", id));
        }
        hello.set_string_content(&content);
        writer.write_frame(&hello).await?;

        let magic = reader.read_handshake().await?;
        if &magic != codec::HANDSHAKE_MAGIC {
            return Err(HmqError::Protocol(
                "Broker rejected the protocol version".to_string(),
            ));
        }
        let accepted = reader.read_frame().await?.ok_or(HmqError::Closed)?;
        if accepted.kind != MessageType::Server
            || accepted.content_type != content_types::ACCEPTED
        {
            return Err(HmqError::Protocol(format!(
                "Connection rejected: {}",
                accepted.content_string()
            )));
        }
        let id = accepted.content_string();

        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(256);
        let shared = Arc::new(ClientShared {
            id,
            options: options.clone(),
            out_tx,
            pending_acks: Mutex::new(HashMap::new()),
            pending_responses: Mutex::new(HashMap::new()),
            pending_pulls: Mutex::new(HashMap::new()),
            pull_requests: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            queue_streams: Mutex::new(HashMap::new()),
            event_handlers: Mutex::new(HashMap::new()),
        });

        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if writer.write_bytes(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => handle_frame(&reader_shared, frame).await,
                    Ok(None) => break,
                    Err(error) => {
                        tracing::debug!(%error, "Client read failed");
                        break;
                    }
                }
            }
        });

        let ping_shared = shared.clone();
        let ping_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(ping_shared.options.ping_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if ping_shared
                    .out_tx
                    .send(Bytes::from_static(&codec::PING))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(Self {
            shared,
            tasks: vec![writer_task, reader_task, ping_task],
        })
    }

    /// The broker-assigned client id
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Push content to a queue. With `wait_ack` the returned result is
    /// the broker's acknowledge (or `Timeout`).
    pub async fn push(
        &self,
        queue: &str,
        content: impl Into<Bytes>,
        wait_ack: bool,
    ) -> Result<PushResult> {
        let mut message = Message::queue(queue, 0);
        message.set_content(content);
        self.push_message(message, wait_ack).await
    }

    /// Push a pre-built queue message
    pub async fn push_message(&self, mut message: Message, wait_ack: bool) -> Result<PushResult> {
        if message.id.is_empty() {
            message.assign_id();
        }
        message.set_source(self.shared.id.clone());
        if !wait_ack {
            self.shared.send(&message).await?;
            return Ok(PushResult::Ok);
        }

        message.pending_acknowledge = true;
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_acks
            .lock()
            .expect("client lock poisoned")
            .insert(message.id.clone(), tx);
        self.shared.send(&message).await?;

        match tokio::time::timeout(
            Duration::from_millis(self.shared.options.ack_timeout_ms),
            rx,
        )
        .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(HmqError::Closed),
            Err(_) => {
                self.shared
                    .pending_acks
                    .lock()
                    .expect("client lock poisoned")
                    .remove(&message.id);
                Ok(PushResult::Timeout)
            }
        }
    }

    /// Send a message expecting a correlated `Response` frame
    pub async fn request(&self, mut message: Message) -> Result<Message> {
        if message.id.is_empty() {
            message.assign_id();
        }
        message.set_source(self.shared.id.clone());
        message.wait_response = true;

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_responses
            .lock()
            .expect("client lock poisoned")
            .insert(message.id.clone(), tx);
        self.shared.send(&message).await?;

        match tokio::time::timeout(
            Duration::from_millis(self.shared.options.response_timeout_ms),
            rx,
        )
        .await
        {
            Ok(Ok(response)) => {
                if response.kind == MessageType::Acknowledge && response.is_negative_ack() {
                    return Err(HmqError::Timeout(format!(
                        "Request '{}' failed: {}",
                        message.id,
                        response.negative_ack_reason().unwrap_or("unknown")
                    )));
                }
                Ok(response)
            }
            Ok(Err(_)) => Err(HmqError::Closed),
            Err(_) => {
                self.shared
                    .pending_responses
                    .lock()
                    .expect("client lock poisoned")
                    .remove(&message.id);
                Err(HmqError::Timeout(format!("Request '{}'", message.id)))
            }
        }
    }

    /// Answer a request with a `Response` frame carrying `content`
    pub async fn respond(&self, request: &Message, content: impl Into<Bytes>) -> Result<()> {
        let mut response = request.create_response();
        response.set_source(self.shared.id.clone());
        response.set_content(content);
        self.shared.send(&response).await
    }

    /// Subscribe to a queue, returning its message stream
    pub async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<Message>> {
        let key = queue.trim().to_ascii_lowercase();
        let (tx, rx) = mpsc::channel(256);
        self.shared
            .queue_streams
            .lock()
            .expect("client lock poisoned")
            .insert(key.clone(), tx);

        match self.server_op(content_types::JOIN, &key, Bytes::new()).await {
            Ok(()) => Ok(rx),
            Err(error) => {
                self.shared
                    .queue_streams
                    .lock()
                    .expect("client lock poisoned")
                    .remove(&key);
                Err(error)
            }
        }
    }

    /// Subscribe to a queue as a `Stream` of messages
    pub async fn subscribe_stream(
        &self,
        queue: &str,
    ) -> Result<tokio_stream::wrappers::ReceiverStream<Message>> {
        let rx = self.subscribe(queue).await?;
        Ok(tokio_stream::wrappers::ReceiverStream::new(rx))
    }

    pub async fn unsubscribe(&self, queue: &str) -> Result<()> {
        let key = queue.trim().to_ascii_lowercase();
        self.shared
            .queue_streams
            .lock()
            .expect("client lock poisoned")
            .remove(&key);
        self.server_op(content_types::LEAVE, &key, Bytes::new()).await
    }

    pub async fn create_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        let content = Bytes::from(serde_json::to_vec(options)?);
        self.server_op(content_types::CREATE_QUEUE, queue, content)
            .await
    }

    pub async fn remove_queue(&self, queue: &str) -> Result<()> {
        self.server_op(content_types::REMOVE_QUEUE, queue, Bytes::new())
            .await
    }

    /// Fetch the head message of a pull queue.
    /// Returns `None` when the queue is empty.
    pub async fn pull(&self, queue: &str) -> Result<Option<Message>> {
        let key = queue.trim().to_ascii_lowercase();
        let mut request = Message::new(MessageType::QueuePullRequest);
        request.assign_id();
        request.set_source(self.shared.id.clone());
        request.set_target(&key);

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_pulls
            .lock()
            .expect("client lock poisoned")
            .insert(key.clone(), tx);
        self.shared
            .pull_requests
            .lock()
            .expect("client lock poisoned")
            .insert(request.id.clone(), key.clone());
        self.shared.send(&request).await?;

        match tokio::time::timeout(
            Duration::from_millis(self.shared.options.ack_timeout_ms),
            rx,
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HmqError::Closed),
            Err(_) => {
                self.shared
                    .pending_pulls
                    .lock()
                    .expect("client lock poisoned")
                    .remove(&key);
                self.shared
                    .pull_requests
                    .lock()
                    .expect("client lock poisoned")
                    .remove(&request.id);
                Err(HmqError::Timeout(format!("Pull from '{}'", key)))
            }
        }
    }

    /// Acknowledge a received message
    pub async fn ack(&self, message: &Message) -> Result<()> {
        let ack = message.create_acknowledge(None);
        self.shared.send(&ack).await
    }

    /// Negatively acknowledge a received message
    pub async fn nack(&self, message: &Message, reason: &str) -> Result<()> {
        let nack = message.create_acknowledge(Some(reason));
        self.shared.send(&nack).await
    }

    /// Register a consumer descriptor. At most one descriptor per
    /// `(target, content type)` pair.
    pub fn register_consumer(&self, descriptor: ConsumerDescriptor) -> Result<()> {
        let key = (
            descriptor.target.trim().to_ascii_lowercase(),
            descriptor.content_type,
        );
        let mut consumers = self
            .shared
            .consumers
            .lock()
            .expect("client lock poisoned");
        if consumers.contains_key(&key) {
            return Err(HmqError::Config(format!(
                "Consumer for ('{}', {}) already registered",
                key.0, key.1
            )));
        }
        consumers.insert(key, Arc::new(descriptor));
        Ok(())
    }

    /// Register an event callback and subscribe server-side.
    /// Callbacks fire in registration order.
    pub async fn on_event(
        &self,
        event: &str,
        target: &str,
        callback: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<()> {
        let key = (event.to_string(), target.trim().to_ascii_lowercase());
        self.shared
            .event_handlers
            .lock()
            .expect("client lock poisoned")
            .entry(key.clone())
            .or_default()
            .push(Arc::new(callback));

        let mut toggle = Message::new(MessageType::Event);
        toggle.set_source(self.shared.id.clone());
        toggle.set_target(&key.1);
        let toggle = toggle
            .with_header("Event", event)
            .with_header("Subscribe", "yes");
        self.shared.send(&toggle).await
    }

    /// List connected clients as reported by the broker
    pub async fn client_list(&self) -> Result<serde_json::Value> {
        self.server_query(content_types::CLIENT_LIST).await
    }

    /// List broker instances
    pub async fn instance_list(&self) -> Result<serde_json::Value> {
        self.server_query(content_types::INSTANCE_LIST).await
    }

    /// Send a Terminate frame and stop the connection tasks
    pub async fn disconnect(self) -> Result<()> {
        let mut terminate = Message::new(MessageType::Terminate);
        terminate.ttl = -1;
        let _ = self.shared.send(&terminate).await;
        Ok(())
    }

    /// Control operation acknowledged by the broker
    async fn server_op(&self, content_type: u16, target: &str, content: Bytes) -> Result<()> {
        let mut frame = Message::new(MessageType::Server);
        frame.content_type = content_type;
        frame.assign_id();
        frame.set_source(self.shared.id.clone());
        frame.set_target(target);
        frame.set_content(content);
        frame.pending_acknowledge = true;

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_acks
            .lock()
            .expect("client lock poisoned")
            .insert(frame.id.clone(), tx);
        self.shared.send(&frame).await?;

        let result = tokio::time::timeout(
            Duration::from_millis(self.shared.options.ack_timeout_ms),
            rx,
        )
        .await;
        match result {
            Ok(Ok(PushResult::Ok)) => Ok(()),
            Ok(Ok(other)) => Err(HmqError::PolicyDenied(other.nack_reason().to_string())),
            Ok(Err(_)) => Err(HmqError::Closed),
            Err(_) => {
                self.shared
                    .pending_acks
                    .lock()
                    .expect("client lock poisoned")
                    .remove(&frame.id);
                Err(HmqError::Timeout(format!("Control op {}", content_type)))
            }
        }
    }

    async fn server_query(&self, content_type: u16) -> Result<serde_json::Value> {
        let mut frame = Message::new(MessageType::Server);
        frame.content_type = content_type;
        frame.assign_id();
        frame.set_source(self.shared.id.clone());

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_responses
            .lock()
            .expect("client lock poisoned")
            .insert(frame.id.clone(), tx);
        self.shared.send(&frame).await?;

        match tokio::time::timeout(
            Duration::from_millis(self.shared.options.ack_timeout_ms),
            rx,
        )
        .await
        {
            Ok(Ok(reply)) => reply.json_content(),
            Ok(Err(_)) => Err(HmqError::Closed),
            Err(_) => {
                self.shared
                    .pending_responses
                    .lock()
                    .expect("client lock poisoned")
                    .remove(&frame.id);
                Err(HmqError::Timeout(format!("Query {}", content_type)))
            }
        }
    }
}

impl Drop for HmqClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Correlate one inbound frame
async fn handle_frame(shared: &Arc<ClientShared>, frame: Message) {
    match frame.kind {
        MessageType::Ping => {
            let _ = shared.out_tx.send(Bytes::from_static(&codec::PONG)).await;
        }
        MessageType::Pong => {}
        MessageType::Acknowledge => {
            let waiter = shared
                .pending_acks
                .lock()
                .expect("client lock poisoned")
                .remove(&frame.id);
            if let Some(tx) = waiter {
                let result = match frame.negative_ack_reason() {
                    Some(reason) => PushResult::from_nack_reason(reason),
                    None => PushResult::Ok,
                };
                let _ = tx.send(result);
                return;
            }

            // A nack may resolve an outstanding pull (Empty and friends)
            let queue = shared
                .pull_requests
                .lock()
                .expect("client lock poisoned")
                .remove(&frame.id);
            if let Some(queue) = queue {
                let waiter = shared
                    .pending_pulls
                    .lock()
                    .expect("client lock poisoned")
                    .remove(&queue);
                if let Some(tx) = waiter {
                    let result = match frame.negative_ack_reason() {
                        Some("empty") => Ok(None),
                        Some(reason) => Err(HmqError::PolicyDenied(reason.to_string())),
                        None => Ok(None),
                    };
                    let _ = tx.send(result);
                }
                return;
            }

            // An unmatched negative ack may resolve a waiting request
            let waiter = shared
                .pending_responses
                .lock()
                .expect("client lock poisoned")
                .remove(&frame.id);
            if let Some(tx) = waiter {
                let _ = tx.send(frame);
            }
        }
        MessageType::Response => {
            let waiter = shared
                .pending_responses
                .lock()
                .expect("client lock poisoned")
                .remove(&frame.id);
            if let Some(tx) = waiter {
                let _ = tx.send(frame);
            }
        }
        MessageType::Server => {
            // List replies correlate by request id
            let waiter = shared
                .pending_responses
                .lock()
                .expect("client lock poisoned")
                .remove(&frame.id);
            if let Some(tx) = waiter {
                let _ = tx.send(frame);
            }
        }
        MessageType::QueueMessage => {
            let queue = frame.target.to_ascii_lowercase();

            let pull_waiter = shared
                .pending_pulls
                .lock()
                .expect("client lock poisoned")
                .remove(&queue);
            if let Some(tx) = pull_waiter {
                shared
                    .pull_requests
                    .lock()
                    .expect("client lock poisoned")
                    .retain(|_, pending_queue| pending_queue != &queue);
                let _ = tx.send(Ok(Some(frame)));
                return;
            }

            if dispatch_to_consumer(shared, &queue, frame.clone()).await {
                return;
            }

            let stream = shared
                .queue_streams
                .lock()
                .expect("client lock poisoned")
                .get(&queue)
                .cloned();
            match stream {
                Some(tx) => {
                    let _ = tx.send(frame).await;
                }
                None => {
                    tracing::debug!(queue = %queue, "Queue message without a consumer");
                }
            }
        }
        MessageType::DirectMessage | MessageType::Router => {
            let key = frame.target.to_ascii_lowercase();
            if !dispatch_to_consumer(shared, &key, frame.clone()).await {
                // Wildcard-target descriptors match on content type alone
                if !dispatch_to_consumer(shared, "", frame.clone()).await {
                    tracing::debug!(
                        content_type = frame.content_type,
                        "Direct message without a consumer"
                    );
                }
            }
        }
        MessageType::Event => {
            let event = frame.header("Event").unwrap_or_default().to_string();
            let key = (event, frame.target.to_ascii_lowercase());
            let callbacks = shared
                .event_handlers
                .lock()
                .expect("client lock poisoned")
                .get(&key)
                .cloned();
            if let Some(callbacks) = callbacks {
                for callback in callbacks {
                    callback(frame.clone());
                }
            }
        }
        MessageType::Terminate | MessageType::QueuePullRequest => {}
    }
}

/// Invoke the descriptor matching `(target, content type)`, if any.
/// The handler runs on its own task; with `auto_ack` the outcome is
/// acknowledged on the handler's behalf.
async fn dispatch_to_consumer(shared: &Arc<ClientShared>, target: &str, frame: Message) -> bool {
    let descriptor = shared
        .consumers
        .lock()
        .expect("client lock poisoned")
        .get(&(target.to_string(), frame.content_type))
        .cloned();
    let Some(descriptor) = descriptor else {
        return false;
    };

    let shared = shared.clone();
    tokio::spawn(async move {
        let wants_ack = frame.pending_acknowledge && descriptor.auto_ack;
        let outcome = descriptor.handler.consume(frame.clone()).await;
        if wants_ack {
            let ack = match &outcome {
                Ok(()) => frame.create_acknowledge(None),
                Err(_) => frame.create_acknowledge(Some("error")),
            };
            let _ = shared.send(&ack).await;
        }
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared() -> (Arc<ClientShared>, mpsc::Receiver<Bytes>) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let shared = Arc::new(ClientShared {
            id: "c-test".to_string(),
            options: ClientOptions::default(),
            out_tx,
            pending_acks: Mutex::new(HashMap::new()),
            pending_responses: Mutex::new(HashMap::new()),
            pending_pulls: Mutex::new(HashMap::new()),
            pull_requests: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            queue_streams: Mutex::new(HashMap::new()),
            event_handlers: Mutex::new(HashMap::new()),
        });
        (shared, out_rx)
    }

    #[test]
    fn test_client_options_defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.ping_interval_ms, 10_000);
        assert_eq!(options.ack_timeout_ms, 30_000);
        assert!(options.id.is_none());
    }

    #[tokio::test]
    async fn test_ack_resolves_pending_push() {
        let (shared, _out_rx) = test_shared();
        let (tx, rx) = oneshot::channel();
        shared
            .pending_acks
            .lock()
            .unwrap()
            .insert("m1".to_string(), tx);

        let mut template = Message::queue("orders", 1);
        template.set_id("m1");
        template.set_source("c-test");
        handle_frame(&shared, template.create_acknowledge(Some("busy"))).await;

        assert_eq!(rx.await.unwrap(), PushResult::Failed("busy".to_string()));
    }

    #[tokio::test]
    async fn test_empty_nack_resolves_pull_with_none() {
        let (shared, _out_rx) = test_shared();
        let (tx, rx) = oneshot::channel();
        shared
            .pending_pulls
            .lock()
            .unwrap()
            .insert("orders".to_string(), tx);
        shared
            .pull_requests
            .lock()
            .unwrap()
            .insert("pull-1".to_string(), "orders".to_string());

        let mut request = Message::new(MessageType::QueuePullRequest);
        request.set_id("pull-1");
        request.set_source("c-test");
        request.set_target("orders");
        handle_frame(&shared, request.create_acknowledge(Some("empty"))).await;

        assert!(rx.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_message_flows_to_stream() {
        let (shared, _out_rx) = test_shared();
        let (tx, mut rx) = mpsc::channel(8);
        shared
            .queue_streams
            .lock()
            .unwrap()
            .insert("orders".to_string(), tx);

        let mut message = Message::queue("Orders", 1001);
        message.set_string_content("hi");
        handle_frame(&shared, message).await;

        assert_eq!(rx.recv().await.unwrap().content_string(), "hi");
    }

    #[tokio::test]
    async fn test_consumer_descriptor_auto_ack() {
        struct Echo;
        #[async_trait]
        impl MessageConsumer for Echo {
            async fn consume(&self, _message: Message) -> Result<()> {
                Ok(())
            }
        }

        let (shared, mut out_rx) = test_shared();
        shared.consumers.lock().unwrap().insert(
            ("orders".to_string(), 1001),
            Arc::new(ConsumerDescriptor {
                target: "orders".to_string(),
                content_type: 1001,
                auto_ack: true,
                handler: Arc::new(Echo),
            }),
        );

        let mut message = Message::queue("orders", 1001);
        message.set_id("m1");
        message.pending_acknowledge = true;
        handle_frame(&shared, message).await;

        let bytes = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let (ack, _) = codec::decode(&bytes).unwrap().unwrap();
        assert_eq!(ack.kind, MessageType::Acknowledge);
        assert_eq!(ack.id, "m1");
        assert!(!ack.is_negative_ack());
    }

    #[tokio::test]
    async fn test_event_callbacks_fire_in_registration_order() {
        let (shared, _out_rx) = test_shared();
        let order = Arc::new(Mutex::new(Vec::new()));
        for index in 0..3 {
            let order = order.clone();
            shared
                .event_handlers
                .lock()
                .unwrap()
                .entry(("queue-created".to_string(), "orders".to_string()))
                .or_default()
                .push(Arc::new(move |_message| {
                    order.lock().unwrap().push(index);
                }));
        }

        let mut event = Message::new(MessageType::Event);
        event.set_target("orders");
        let event = event.with_header("Event", "queue-created");
        handle_frame(&shared, event).await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
