//! Broker — process state, TCP accept loop, and frame dispatch
//!
//! The broker owns the queues map, the client registry, the routers map,
//! the delivery tracker, and the default delivery-handler factory.
//! Connections run one reader task and one writer task each; every frame
//! read is dispatched from the reader task into the owning queue's event
//! stream or relayed directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use crate::codec::{self, content_types, FrameReader, FrameWriter};
use crate::error::{HmqError, Result};
use crate::message::{Message, MessageType};
use crate::options::{BrokerOptions, PushResult, QueueOptions};
use crate::persist::{QueueJournal, JOURNAL_EXTENSION};
use crate::queue::handler::{
    AckDeliveryHandler, DurableDeliveryHandler, HandlerPipeline, JustAllowHandler,
};
use crate::queue::{self, QueueHandle, QueueInfo, QueueServices, RouteRequest};
use crate::registry::{ClientHandle, ClientInfo, ClientRegistry};
use crate::router::Router;
use crate::tracker::{DeliveryRecord, DeliveryTracker};

/// Builds the delivery-handler pipeline for a newly created queue
pub type HandlerFactory = Arc<dyn Fn(&str) -> HandlerPipeline + Send + Sync>;

struct QueueEntry {
    handle: QueueHandle,
    journal: Option<Arc<tokio::sync::Mutex<QueueJournal>>>,
}

struct BrokerInner {
    options: BrokerOptions,
    registry: Arc<ClientRegistry>,
    tracker: DeliveryTracker,
    queues: RwLock<HashMap<String, QueueEntry>>,
    routers: RwLock<HashMap<String, Arc<Router>>>,
    handler_factory: RwLock<Option<HandlerFactory>>,
    data_dir: RwLock<Option<PathBuf>>,
    remove_tx: mpsc::UnboundedSender<String>,
    route_tx: mpsc::UnboundedSender<RouteRequest>,
    response_expiry_tx: mpsc::UnboundedSender<DeliveryRecord>,
    /// (event name, target key) → subscribed client ids
    event_subs: RwLock<HashMap<(String, String), Vec<String>>>,
}

/// The message-queue broker
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(options: BrokerOptions) -> Self {
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        let (route_tx, route_rx) = mpsc::unbounded_channel();
        let (response_expiry_tx, response_expiry_rx) = mpsc::unbounded_channel();

        let broker = Self {
            inner: Arc::new(BrokerInner {
                options,
                registry: Arc::new(ClientRegistry::new()),
                tracker: DeliveryTracker::new(),
                queues: RwLock::new(HashMap::new()),
                routers: RwLock::new(HashMap::new()),
                handler_factory: RwLock::new(None),
                data_dir: RwLock::new(None),
                remove_tx,
                route_tx,
                response_expiry_tx,
                event_subs: RwLock::new(HashMap::new()),
            }),
        };

        broker.spawn_service_tasks(remove_rx, route_rx, response_expiry_rx);
        broker
    }

    /// Replace the default delivery-handler factory
    pub async fn set_handler_factory(&self, factory: HandlerFactory) {
        *self.inner.handler_factory.write().await = Some(factory);
    }

    /// Enable durable queues under `dir`. Newly created queues get a
    /// journal and the durable handler in their default pipeline.
    pub async fn set_data_dir(&self, dir: impl Into<PathBuf>) {
        *self.inner.data_dir.write().await = Some(dir.into());
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.inner.options
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.inner.registry
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.inner.tracker
    }

    // ─── Queues ──────────────────────────────────────────────────────

    /// Create a queue. Fails when the (case-insensitive) name exists or
    /// is invalid.
    pub async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<QueueHandle> {
        let key = normalize_queue_name(name)?;
        let mut queues = self.inner.queues.write().await;
        if queues.contains_key(&key) {
            return Err(HmqError::Config(format!("Queue '{}' already exists", key)));
        }

        let data_dir = self.inner.data_dir.read().await.clone();
        let (journal, replayed) = match &data_dir {
            Some(dir) => {
                let (journal, replayed) = QueueJournal::open(dir, &key)?;
                (Some(Arc::new(tokio::sync::Mutex::new(journal))), replayed)
            }
            None => (None, Vec::new()),
        };

        let pipeline = match self.inner.handler_factory.read().await.as_ref() {
            Some(factory) => factory(&key),
            None => default_pipeline(journal.is_some()),
        };

        let services = QueueServices {
            registry: self.inner.registry.clone(),
            tracker: self.inner.tracker.clone(),
            remove_tx: self.inner.remove_tx.clone(),
            route_tx: self.inner.route_tx.clone(),
        };
        let handle = queue::spawn(
            key.clone(),
            options,
            pipeline,
            journal.clone(),
            replayed,
            services,
        );

        queues.insert(
            key.clone(),
            QueueEntry {
                handle: handle.clone(),
                journal,
            },
        );
        drop(queues);

        self.emit_event("queue-created", &key, serde_json::json!({ "queue": key }))
            .await;
        Ok(handle)
    }

    /// Find a queue by case-insensitive name
    pub async fn find_queue(&self, name: &str) -> Option<QueueHandle> {
        let key = name.trim().to_ascii_lowercase();
        self.inner
            .queues
            .read()
            .await
            .get(&key)
            .map(|entry| entry.handle.clone())
    }

    /// Auto-create a queue with the default options, when allowed
    pub async fn try_auto_create(&self, name: &str) -> Option<QueueHandle> {
        if !self.inner.options.auto_queue_creation {
            return None;
        }
        match self
            .create_queue(name, self.inner.options.default_queue_options.clone())
            .await
        {
            Ok(handle) => Some(handle),
            // Lost a creation race; the queue exists now
            Err(_) => self.find_queue(name).await,
        }
    }

    async fn find_or_auto_create(&self, name: &str) -> Option<QueueHandle> {
        match self.find_queue(name).await {
            Some(handle) => Some(handle),
            None => self.try_auto_create(name).await,
        }
    }

    /// Remove a queue: cancels outstanding deliveries with negative acks
    /// to producers, drops subscriptions, deletes the journal
    pub async fn remove_queue(&self, name: &str) -> Result<()> {
        let key = name.trim().to_ascii_lowercase();
        let entry = self
            .inner
            .queues
            .write()
            .await
            .remove(&key)
            .ok_or_else(|| HmqError::NotFound(format!("Queue '{}'", key)))?;

        entry.handle.stop().await?;
        if let Some(journal) = entry.journal {
            if let Err(error) = journal.lock().await.delete_file() {
                tracing::warn!(queue = %key, %error, "Journal not deleted");
            }
        }

        self.emit_event("queue-removed", &key, serde_json::json!({ "queue": key }))
            .await;
        Ok(())
    }

    pub async fn queue_info(&self, name: &str) -> Result<QueueInfo> {
        let handle = self
            .find_queue(name)
            .await
            .ok_or_else(|| HmqError::NotFound(format!("Queue '{}'", name)))?;
        handle.info().await
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.inner.queues.read().await.keys().cloned().collect()
    }

    /// In-process push awaiting the producer-visible outcome
    pub async fn push(&self, queue: &str, message: Message) -> Result<PushResult> {
        let handle = self
            .find_or_auto_create(queue)
            .await
            .ok_or_else(|| HmqError::NotFound(format!("Queue '{}'", queue)))?;
        handle.push(message).await
    }

    /// Recreate durable queues from the journals under the data dir
    pub async fn restore_queues(&self) -> Result<usize> {
        let Some(dir) = self.inner.data_dir.read().await.clone() else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }
        let mut restored = 0;
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| HmqError::Persistence(format!("Failed to scan {}: {}", dir.display(), e)))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if self.find_queue(name).await.is_some() {
                continue;
            }
            self.create_queue(name, self.inner.options.default_queue_options.clone())
                .await?;
            restored += 1;
        }
        Ok(restored)
    }

    // ─── Routers ─────────────────────────────────────────────────────

    pub async fn add_router(&self, name: &str) -> Arc<Router> {
        let key = name.trim().to_ascii_lowercase();
        let mut routers = self.inner.routers.write().await;
        routers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Router::new(key)))
            .clone()
    }

    pub async fn find_router(&self, name: &str) -> Option<Arc<Router>> {
        let key = name.trim().to_ascii_lowercase();
        self.inner.routers.read().await.get(&key).cloned()
    }

    // ─── Server ──────────────────────────────────────────────────────

    /// Bind and serve. Durable queues are restored first when a data dir
    /// is configured. Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        self.restore_queues().await?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| HmqError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| HmqError::ConnectionFailed(e.to_string()))?;
        tracing::info!(addr = %local_addr, broker = %self.inner.options.name, "Listening");

        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let broker = broker.clone();
                        tokio::spawn(async move {
                            handle_connection(broker, stream, peer).await;
                        });
                    }
                    Err(error) => {
                        tracing::warn!(%error, "Accept failed");
                    }
                }
            }
        });
        Ok(local_addr)
    }

    // ─── Events ──────────────────────────────────────────────────────

    /// Toggle a client's server-side event subscription
    async fn set_event_subscription(
        &self,
        client_id: &str,
        event: &str,
        target: &str,
        enabled: bool,
    ) {
        let key = (event.to_string(), target.to_ascii_lowercase());
        let mut subs = self.inner.event_subs.write().await;
        let entry = subs.entry(key).or_default();
        entry.retain(|id| id != client_id);
        if enabled {
            entry.push(client_id.to_string());
        }
    }

    /// Emit an event frame to every subscribed client, in subscription order
    async fn emit_event(&self, event: &str, target: &str, payload: serde_json::Value) {
        let key = (event.to_string(), target.to_ascii_lowercase());
        let subscribers = {
            let subs = self.inner.event_subs.read().await;
            match subs.get(&key) {
                Some(ids) if !ids.is_empty() => ids.clone(),
                _ => return,
            }
        };

        let mut frame = Message::new(MessageType::Event);
        frame.set_source(&self.inner.options.name);
        frame.set_target(target);
        frame = frame.with_header("Event", event);
        if frame.set_json_content(&payload).is_err() {
            return;
        }

        for client_id in subscribers {
            if let Some(client) = self.inner.registry.find_by_id(&client_id).await {
                let _ = client.send(&frame).await;
            }
        }
    }

    // ─── Service tasks ───────────────────────────────────────────────

    fn spawn_service_tasks(
        &self,
        mut remove_rx: mpsc::UnboundedReceiver<String>,
        mut route_rx: mpsc::UnboundedReceiver<RouteRequest>,
        mut response_expiry_rx: mpsc::UnboundedReceiver<DeliveryRecord>,
    ) {
        // Auto-destroy removals
        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(name) = remove_rx.recv().await {
                if broker.remove_queue(&name).await.is_ok() {
                    tracing::info!(queue = %name, "Queue auto-destroyed");
                }
            }
        });

        // Route-status queue forwarding
        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(request) = route_rx.recv().await {
                let result = match broker.find_router(&request.router).await {
                    Some(router) => router.route(&broker, request.message.clone()).await,
                    None => PushResult::NotFound,
                };
                if request.message.pending_acknowledge {
                    broker
                        .send_result_ack(&request.message, &result)
                        .await;
                }
                if let Some(reply) = request.reply {
                    let _ = reply.send(result);
                }
            }
        });

        // Response-deadline expirations
        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(record) = response_expiry_rx.recv().await {
                tracing::debug!(
                    message_id = %record.message_id,
                    responder = %record.consumer_id,
                    "Response timed out"
                );
                let nack = record.message.create_acknowledge(Some("timeout"));
                if let Some(requester) = &record.producer_id {
                    if let Some(client) = broker.inner.registry.find_by_id(requester).await {
                        let _ = client.send(&nack).await;
                    }
                }
            }
        });
    }

    async fn send_result_ack(&self, message: &Message, result: &PushResult) {
        let Some(producer) = self.inner.registry.find_by_id(&message.source).await else {
            return;
        };
        let reason = if result.is_ok() {
            None
        } else {
            Some(result.nack_reason())
        };
        let ack = message.create_acknowledge(reason);
        let _ = producer.send(&ack).await;
    }

    // ─── Frame dispatch ──────────────────────────────────────────────

    /// Process one inbound frame. Returns false when the connection
    /// should close.
    async fn process_frame(&self, client: &ClientHandle, mut frame: Message) -> bool {
        match frame.kind {
            MessageType::Ping => {
                let _ = client.send_bytes(Bytes::from_static(&codec::PONG)).await;
                true
            }
            MessageType::Pong => true,
            MessageType::Terminate => false,
            _ => {
                // The authenticated connection identity always wins
                frame.set_source(client.id());
                self.dispatch_frame(client, frame).await;
                true
            }
        }
    }

    async fn dispatch_frame(&self, client: &ClientHandle, frame: Message) {
        match frame.kind {
            MessageType::Server => self.handle_server_frame(client, frame).await,
            MessageType::QueueMessage => {
                match self.find_or_auto_create(&frame.target).await {
                    Some(queue) => {
                        let _ = queue.enqueue(frame).await;
                    }
                    None => {
                        self.nack_to(client, &frame, "not-found").await;
                    }
                }
            }
            MessageType::QueuePullRequest => match self.find_queue(&frame.target).await {
                Some(queue) => {
                    let _ = queue.pull(client.clone(), frame).await;
                }
                None => {
                    let nack = frame.create_acknowledge(Some("not-found"));
                    let _ = client.send(&nack).await;
                }
            },
            MessageType::Acknowledge => {
                if let Some(queue_name) = self.inner.tracker.queue_of(&frame.id) {
                    if let Some(queue) = self.find_queue(&queue_name).await {
                        let _ = queue.ack(frame).await;
                        return;
                    }
                }
                // Ack for a direct message: relay to its target
                self.relay(client, frame).await;
            }
            MessageType::DirectMessage => self.handle_direct(client, frame).await,
            MessageType::Response => {
                self.inner.tracker.resolve_response(&frame.id);
                self.relay(client, frame).await;
            }
            MessageType::Router => {
                let result = match self.find_router(&frame.target).await {
                    Some(router) => router.route(self, frame.clone()).await,
                    None => PushResult::NotFound,
                };
                if frame.pending_acknowledge || frame.wait_response {
                    if !result.is_ok() || frame.pending_acknowledge {
                        let reason = if result.is_ok() {
                            None
                        } else {
                            Some(result.nack_reason())
                        };
                        let ack = frame.create_acknowledge(reason);
                        let _ = client.send(&ack).await;
                    }
                }
            }
            MessageType::Event => {
                let event = frame.header("Event").unwrap_or_default().to_string();
                let enabled = frame
                    .header("Subscribe")
                    .map(|v| v.eq_ignore_ascii_case("yes"))
                    .unwrap_or(true);
                self.set_event_subscription(client.id(), &event, &frame.target, enabled)
                    .await;
            }
            MessageType::Ping | MessageType::Pong | MessageType::Terminate => {}
        }
    }

    async fn handle_server_frame(&self, client: &ClientHandle, frame: Message) {
        match frame.content_type {
            content_types::CREATE_QUEUE => {
                let options = if frame.content.is_empty() {
                    self.inner.options.default_queue_options.clone()
                } else {
                    match frame.json_content::<QueueOptions>() {
                        Ok(options) => options,
                        Err(_) => {
                            self.nack_to(client, &frame, "unacceptable").await;
                            return;
                        }
                    }
                };
                let exists = self.find_queue(&frame.target).await.is_some();
                let created = exists || self.create_queue(&frame.target, options).await.is_ok();
                if created {
                    self.ack_to(client, &frame).await;
                } else {
                    self.nack_to(client, &frame, "unacceptable").await;
                }
            }
            content_types::REMOVE_QUEUE => match self.remove_queue(&frame.target).await {
                Ok(()) => self.ack_to(client, &frame).await,
                Err(_) => self.nack_to(client, &frame, "not-found").await,
            },
            content_types::JOIN => match self.find_or_auto_create(&frame.target).await {
                Some(queue) => {
                    let _ = queue.subscribe(client.clone()).await;
                    self.ack_to(client, &frame).await;
                    self.emit_event(
                        "client-joined",
                        queue.name(),
                        serde_json::json!({ "client": client.id(), "queue": queue.name() }),
                    )
                    .await;
                }
                None => self.nack_to(client, &frame, "not-found").await,
            },
            content_types::LEAVE => match self.find_queue(&frame.target).await {
                Some(queue) => {
                    let _ = queue.unsubscribe(client.id()).await;
                    self.ack_to(client, &frame).await;
                    self.emit_event(
                        "client-left",
                        queue.name(),
                        serde_json::json!({ "client": client.id(), "queue": queue.name() }),
                    )
                    .await;
                }
                None => self.nack_to(client, &frame, "not-found").await,
            },
            content_types::CLIENT_LIST => {
                let hide = self.inner.options.hide_client_names;
                let clients: Vec<ClientSummary> = self
                    .inner
                    .registry
                    .all()
                    .await
                    .into_iter()
                    .map(|handle| ClientSummary {
                        id: handle.id().to_string(),
                        name: if hide {
                            "*".to_string()
                        } else {
                            handle.name().to_string()
                        },
                        client_type: handle.client_type().to_string(),
                    })
                    .collect();
                self.reply_json(client, &frame, content_types::CLIENT_LIST, &clients)
                    .await;
            }
            content_types::INSTANCE_LIST => {
                let info = vec![InstanceSummary {
                    name: self.inner.options.name.clone(),
                    queues: self.inner.queues.read().await.len(),
                    clients: self.inner.registry.len().await,
                }];
                self.reply_json(client, &frame, content_types::INSTANCE_LIST, &info)
                    .await;
            }
            _ => {
                if frame.pending_acknowledge {
                    self.nack_to(client, &frame, "unacceptable").await;
                }
            }
        }
    }

    async fn handle_direct(&self, client: &ClientHandle, mut frame: Message) {
        frame.ttl -= 1;
        if frame.ttl < 0 {
            tracing::debug!(message_id = %frame.id, "Direct message dropped on ttl");
            if frame.pending_acknowledge || frame.wait_response {
                self.nack_to(client, &frame, "ttl-exceeded").await;
            }
            return;
        }

        let mut targets = self.inner.registry.resolve_target(&frame.target).await;
        if frame.first_acquirer_only {
            targets.truncate(1);
        }
        if targets.is_empty() {
            if frame.pending_acknowledge || frame.wait_response {
                self.nack_to(client, &frame, "not-found").await;
            }
            return;
        }

        if frame.wait_response && !frame.id.is_empty() {
            let record =
                DeliveryRecord::for_response(frame.clone(), targets[0].id(), client.id());
            let deadline =
                Instant::now() + Duration::from_millis(self.inner.options.response_timeout_ms);
            self.inner
                .tracker
                .follow(record, deadline, self.inner.response_expiry_tx.clone());
        }

        let mut sent = 0usize;
        for target in &targets {
            if target.send(&frame).await.is_ok() {
                sent += 1;
            }
        }
        if sent == 0 && (frame.pending_acknowledge || frame.wait_response) {
            self.inner.tracker.resolve_response(&frame.id);
            self.nack_to(client, &frame, "send-error").await;
        }
    }

    /// Relay a frame to the client(s) its target resolves to
    async fn relay(&self, client: &ClientHandle, frame: Message) {
        let targets = self.inner.registry.resolve_target(&frame.target).await;
        if targets.is_empty() {
            tracing::debug!(target = %frame.target, "Relay target not connected");
            return;
        }
        for target in targets {
            if target.send(&frame).await.is_err() {
                tracing::debug!(client = %client.id(), target = %target.id(), "Relay failed");
            }
        }
    }

    async fn ack_to(&self, client: &ClientHandle, frame: &Message) {
        let ack = frame.create_acknowledge(None);
        let _ = client.send(&ack).await;
    }

    async fn nack_to(&self, client: &ClientHandle, frame: &Message, reason: &str) {
        let nack = frame.create_acknowledge(Some(reason));
        let _ = client.send(&nack).await;
    }

    async fn reply_json<T: Serialize>(
        &self,
        client: &ClientHandle,
        request: &Message,
        content_type: u16,
        value: &T,
    ) {
        let mut reply = Message::new(MessageType::Server);
        reply.content_type = content_type;
        reply.set_id(request.id.clone());
        reply.set_source(&self.inner.options.name);
        reply.set_target(request.source.clone());
        if reply.set_json_content(value).is_ok() {
            let _ = client.send(&reply).await;
        }
    }

    // ─── Disconnect ──────────────────────────────────────────────────

    async fn disconnect(&self, client: &ClientHandle) {
        let client_id = client.id().to_string();
        self.inner.registry.remove_by_id(&client_id).await;

        // Cancel in-flight deliveries and hand them back to their queues
        // so undelivered messages are requeued
        let canceled = self.inner.tracker.cancel_by_consumer(&client_id);
        let mut by_queue: HashMap<String, Vec<DeliveryRecord>> = HashMap::new();
        for record in canceled {
            match &record.queue_name {
                Some(queue) => by_queue.entry(queue.clone()).or_default().push(record),
                None => {
                    // Responder gone: fail the requester's wait
                    if let Some(requester) = &record.producer_id {
                        if let Some(handle) = self.inner.registry.find_by_id(requester).await {
                            let nack = record.message.create_acknowledge(Some("send-error"));
                            let _ = handle.send(&nack).await;
                        }
                    }
                }
            }
        }

        let queues: Vec<QueueHandle> = {
            let map = self.inner.queues.read().await;
            map.values().map(|entry| entry.handle.clone()).collect()
        };
        for queue in queues {
            let records = by_queue.remove(queue.name()).unwrap_or_default();
            let _ = queue.client_lost(client.clone(), records).await;
        }

        // Drop event subscriptions
        let mut subs = self.inner.event_subs.write().await;
        for ids in subs.values_mut() {
            ids.retain(|id| id != &client_id);
        }

        tracing::info!(client = %client_id, "Client disconnected");
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientSummary {
    id: String,
    name: String,
    client_type: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceSummary {
    name: String,
    queues: usize,
    clients: usize,
}

fn default_pipeline(durable: bool) -> HandlerPipeline {
    let mut handlers: Vec<Arc<dyn crate::queue::handler::DeliveryHandler>> = vec![
        Arc::new(JustAllowHandler),
        Arc::new(AckDeliveryHandler::default()),
    ];
    if durable {
        handlers.push(Arc::new(DurableDeliveryHandler));
    }
    HandlerPipeline::new(handlers)
}

fn normalize_queue_name(name: &str) -> Result<String> {
    let key = name.trim().to_ascii_lowercase();
    if key.is_empty() || key.len() > 64 {
        return Err(HmqError::Config(format!("Invalid queue name '{}'", name)));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(HmqError::Config(format!("Invalid queue name '{}'", name)));
    }
    Ok(key)
}

// ─── Connection handling ─────────────────────────────────────────────

async fn handle_connection(broker: Broker, stream: TcpStream, peer: SocketAddr) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    // Handshake: magic, hello frame, magic back, accepted frame
    let Ok(magic) = reader.read_handshake().await else {
        return;
    };
    if &magic != codec::HANDSHAKE_MAGIC {
        tracing::debug!(%peer, "Bad handshake magic");
        let mut failed = Message::new(MessageType::Server);
        failed.content_type = content_types::FAILED;
        failed.set_string_content("unsupported protocol version");
        let _ = writer.write_frame(&failed).await;
        return;
    }
    if writer.write_bytes(codec::HANDSHAKE_MAGIC).await.is_err() {
        return;
    }

    let hello = match reader.read_frame().await {
        Ok(Some(frame))
            if frame.kind == MessageType::Server
                && frame.content_type == content_types::HELLO =>
        {
            frame
        }
        _ => {
            tracing::debug!(%peer, "Missing hello frame");
            return;
        }
    };
    let hello_fields = parse_hello(&hello.content_string());

    if broker.inner.options.client_limit > 0
        && broker.inner.registry.len().await >= broker.inner.options.client_limit
    {
        let mut failed = Message::new(MessageType::Server);
        failed.content_type = content_types::FAILED;
        failed.set_string_content("client limit reached");
        let _ = writer.write_frame(&failed).await;
        return;
    }

    let id = hello_fields
        .get("Id")
        .cloned()
        .unwrap_or_else(|| format!("client-{}", uuid::Uuid::new_v4()));
    let info = ClientInfo {
        id: id.clone(),
        name: hello_fields.get("Name").cloned().unwrap_or_default(),
        client_type: hello_fields.get("Type").cloned().unwrap_or_default(),
        joined_at: Utc::now(),
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(256);
    let handle = ClientHandle::new(info, out_tx);
    if broker.inner.registry.add(handle.clone()).await.is_err() {
        let mut failed = Message::new(MessageType::Server);
        failed.content_type = content_types::FAILED;
        failed.set_string_content("duplicate client id");
        let _ = writer.write_frame(&failed).await;
        return;
    }

    let mut accepted = Message::new(MessageType::Server);
    accepted.content_type = content_types::ACCEPTED;
    accepted.set_target(&id);
    accepted.set_string_content(&id);
    if writer.write_frame(&accepted).await.is_err() {
        broker.inner.registry.remove_by_id(&id).await;
        return;
    }

    tracing::info!(client = %id, %peer, "Client connected");

    // Shared writer: every frame for this client flows through one task
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if writer.write_bytes(&bytes).await.is_err() {
                break;
            }
        }
    });

    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                if !broker.process_frame(&handle, frame).await {
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                tracing::debug!(client = %id, %error, "Read failed");
                break;
            }
        }
    }

    broker.disconnect(&handle).await;
    writer_task.abort();
}

/// Parse the hello content: a `method path` line, then `Name: Value` lines
fn parse_hello(content: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in content.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            fields.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
    fields
}
