//! Queue engine — per-queue state machine and dispatcher
//!
//! Every queue is a single-writer actor: all events (`push`, `pull`,
//! `subscribe`, `unsubscribe`, `ack`, timers, status changes) arrive on
//! one mpsc channel and are processed in order by the queue's own task,
//! so subscription set, store, and status are only ever touched from
//! that task. Delivery handlers are consulted on every transition and
//! in-flight work is registered with the delivery tracker. A slow hook
//! or consumer blocks only its own queue.

pub mod handler;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{HmqError, Result};
use crate::message::Message;
use crate::options::{Acknowledge, AutoDestroy, PushResult, QueueOptions, QueueStatus};
use crate::persist::QueueJournal;
use crate::registry::{ClientHandle, ClientRegistry};
use crate::tracker::{DeliveryRecord, DeliveryTracker};

use handler::{AckVote, HandlerPipeline, KeepPolicy, QueueContext};
use store::MessageStore;

/// Events accepted by a queue's serialized stream
pub enum QueueEvent {
    /// Producer push. `reply` resolves with the producer-visible outcome
    /// (immediately, or after delivery resolution under
    /// `WaitForAcknowledge`).
    Push {
        message: Message,
        reply: Option<oneshot::Sender<PushResult>>,
    },
    /// Explicit fetch on a pull queue
    Pull {
        consumer: ClientHandle,
        request: Message,
    },
    Subscribe {
        client: ClientHandle,
    },
    Unsubscribe {
        client_id: String,
    },
    /// Consumer connection closed; canceled tracker records included
    ClientLost {
        client: ClientHandle,
        canceled: Vec<DeliveryRecord>,
    },
    /// Acknowledge frame for a delivery tracked by this queue
    Ack {
        ack: Message,
    },
    StatusChange {
        status: QueueStatus,
    },
    /// Kick the dispatcher (delayed-send wakeups)
    Trigger,
    Info {
        reply: oneshot::Sender<QueueInfo>,
    },
    Stop {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Per-queue counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub received: u64,
    pub sent: u64,
    pub acked: u64,
    pub nacked: u64,
    pub timed_out: u64,
    pub errors: u64,
}

/// Point-in-time queue snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub name: String,
    pub status: QueueStatus,
    pub stored: usize,
    pub in_flight: usize,
    pub subscribers: usize,
    pub stats: QueueStats,
}

/// Route-status forwarding request handed back to the broker
pub struct RouteRequest {
    pub router: String,
    pub message: Message,
    pub reply: Option<oneshot::Sender<PushResult>>,
}

/// Broker-side collaborators a queue actor needs
#[derive(Clone)]
pub struct QueueServices {
    pub registry: Arc<ClientRegistry>,
    pub tracker: DeliveryTracker,
    /// Auto-destroy notifications (queue name)
    pub remove_tx: mpsc::UnboundedSender<String>,
    /// Route-status messages handed to the broker's router layer
    pub route_tx: mpsc::UnboundedSender<RouteRequest>,
}

/// Cheap clonable handle to a queue actor
#[derive(Clone)]
pub struct QueueHandle {
    name: String,
    tx: mpsc::Sender<QueueEvent>,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push and await the producer-visible outcome
    pub async fn push(&self, message: Message) -> Result<PushResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueEvent::Push {
            message,
            reply: Some(reply_tx),
        })
        .await?;
        reply_rx.await.map_err(|_| HmqError::Closed)
    }

    /// Push without awaiting the outcome; acks flow back as frames
    pub async fn enqueue(&self, message: Message) -> Result<()> {
        self.send(QueueEvent::Push {
            message,
            reply: None,
        })
        .await
    }

    pub async fn subscribe(&self, client: ClientHandle) -> Result<()> {
        self.send(QueueEvent::Subscribe { client }).await
    }

    pub async fn unsubscribe(&self, client_id: &str) -> Result<()> {
        self.send(QueueEvent::Unsubscribe {
            client_id: client_id.to_string(),
        })
        .await
    }

    pub async fn client_lost(
        &self,
        client: ClientHandle,
        canceled: Vec<DeliveryRecord>,
    ) -> Result<()> {
        self.send(QueueEvent::ClientLost { client, canceled }).await
    }

    pub async fn pull(&self, consumer: ClientHandle, request: Message) -> Result<()> {
        self.send(QueueEvent::Pull { consumer, request }).await
    }

    pub async fn ack(&self, ack: Message) -> Result<()> {
        self.send(QueueEvent::Ack { ack }).await
    }

    pub async fn set_status(&self, status: QueueStatus) -> Result<()> {
        self.send(QueueEvent::StatusChange { status }).await
    }

    pub async fn info(&self) -> Result<QueueInfo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueEvent::Info { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| HmqError::Closed)
    }

    pub async fn stop(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueEvent::Stop {
            reply: Some(reply_tx),
        })
        .await?;
        reply_rx.await.map_err(|_| HmqError::Closed)
    }

    async fn send(&self, event: QueueEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| HmqError::NotFound(format!("Queue '{}' is gone", self.name)))
    }
}

/// Spawn a queue actor and return its handle
///
/// `initial` seeds the store (journal replay); `journal` makes the
/// context durable for handlers that persist.
pub fn spawn(
    name: impl Into<String>,
    options: QueueOptions,
    pipeline: HandlerPipeline,
    journal: Option<Arc<Mutex<QueueJournal>>>,
    initial: Vec<Message>,
    services: QueueServices,
) -> QueueHandle {
    let name = name.into();
    let (event_tx, event_rx) = mpsc::channel(256);
    let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();

    let mut store = MessageStore::new(options.message_limit);
    for message in initial {
        if let Err(dropped) = store.push(message) {
            tracing::warn!(queue = %name, message_id = %dropped.id, "Replayed message over limit, dropped");
        }
    }

    let status = options.status;
    let ctx = QueueContext {
        queue: name.clone(),
        options: options.clone(),
        journal,
    };

    let actor = QueueActor {
        name: name.clone(),
        status,
        options,
        ctx,
        store,
        pipeline,
        subscribers: Vec::new(),
        rr_cursor: 0,
        push_cursor: 0,
        next_allowed: HashMap::new(),
        awaiting_ack: HashSet::new(),
        pending_replies: HashMap::new(),
        stats: QueueStats::default(),
        services,
        event_tx: event_tx.clone(),
        expiry_tx,
        trigger_scheduled: false,
        stopping: false,
    };

    tokio::spawn(actor.run(event_rx, expiry_rx));

    QueueHandle { name, tx: event_tx }
}

struct QueueActor {
    name: String,
    status: QueueStatus,
    options: QueueOptions,
    ctx: QueueContext,
    store: MessageStore,
    pipeline: HandlerPipeline,
    subscribers: Vec<ClientHandle>,
    /// Round-robin position; resets on consumer drop
    rr_cursor: usize,
    /// Fairness rotation for Running/Push dispatch
    push_cursor: usize,
    /// Earliest next send per consumer under delay_between_messages
    next_allowed: HashMap<String, Instant>,
    /// Consumers with an unresolved tracked delivery
    awaiting_ack: HashSet<String>,
    /// In-process producers awaiting a deferred outcome, by message id
    pending_replies: HashMap<String, oneshot::Sender<PushResult>>,
    stats: QueueStats,
    services: QueueServices,
    event_tx: mpsc::Sender<QueueEvent>,
    expiry_tx: mpsc::UnboundedSender<DeliveryRecord>,
    trigger_scheduled: bool,
    stopping: bool,
}

impl QueueActor {
    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<QueueEvent>,
        mut expiry_rx: mpsc::UnboundedReceiver<DeliveryRecord>,
    ) {
        tracing::info!(queue = %self.name, status = ?self.status, "Queue started");
        let mut sweep = tokio::time::interval(Duration::from_millis(500));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                Some(record) = expiry_rx.recv() => {
                    self.handle_ack_timeout(record).await;
                    self.dispatch().await;
                }
                _ = sweep.tick(), if self.options.send_timeout_ms > 0 => {
                    self.sweep_timed_out().await;
                }
            }
            if self.stopping {
                break;
            }
            self.maybe_compact().await;
            self.check_auto_destroy();
        }
        tracing::info!(queue = %self.name, "Queue stopped");
    }

    /// Rewrite the journal once most of its records are tombstoned.
    /// Skipped while deliveries are in flight: their messages live in
    /// the journal but not in the store.
    async fn maybe_compact(&mut self) {
        let Some(journal) = &self.ctx.journal else {
            return;
        };
        if !self.awaiting_ack.is_empty() {
            return;
        }
        let mut journal = journal.lock().await;
        if !journal.should_compact() {
            return;
        }
        if let Err(error) = journal.compact(self.store.iter()) {
            tracing::warn!(queue = %self.name, %error, "Journal compaction failed");
        }
    }

    async fn handle_event(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Push { message, reply } => {
                self.handle_push(message, reply).await;
                self.dispatch().await;
            }
            QueueEvent::Pull { consumer, request } => {
                self.handle_pull(consumer, request).await;
            }
            QueueEvent::Subscribe { client } => {
                if !self.subscribers.iter().any(|s| s.id() == client.id()) {
                    tracing::debug!(queue = %self.name, client = %client.id(), "Subscribed");
                    self.subscribers.push(client);
                }
                self.dispatch().await;
            }
            QueueEvent::Unsubscribe { client_id } => {
                self.remove_subscriber(&client_id);
            }
            QueueEvent::ClientLost { client, canceled } => {
                self.handle_client_lost(client, canceled).await;
                self.dispatch().await;
            }
            QueueEvent::Ack { ack } => {
                self.handle_ack(ack).await;
                self.dispatch().await;
            }
            QueueEvent::StatusChange { status } => {
                tracing::info!(queue = %self.name, from = ?self.status, to = ?status, "Status changed");
                self.status = status;
                self.dispatch().await;
            }
            QueueEvent::Trigger => {
                self.trigger_scheduled = false;
                self.dispatch().await;
            }
            QueueEvent::Info { reply } => {
                let _ = reply.send(QueueInfo {
                    name: self.name.clone(),
                    status: self.status,
                    stored: self.store.len(),
                    in_flight: self.awaiting_ack.len(),
                    subscribers: self.subscribers.len(),
                    stats: self.stats.clone(),
                });
            }
            QueueEvent::Stop { reply } => {
                self.shutdown().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    // ─── Push ────────────────────────────────────────────────────────

    async fn handle_push(&mut self, mut message: Message, reply: Option<oneshot::Sender<PushResult>>) {
        if self.status == QueueStatus::Stopped {
            self.reject(message, reply, PushResult::Unacceptable).await;
            return;
        }
        if self.status == QueueStatus::OnlyConsume {
            self.reject(message, reply, PushResult::Unauthorized).await;
            return;
        }
        if self.options.message_size_limit > 0
            && message.content.len() > self.options.message_size_limit
        {
            self.reject(message, reply, PushResult::Unacceptable).await;
            return;
        }

        if self.options.use_message_id && message.id.is_empty() {
            message.assign_id();
        }
        if self.options.use_message_id
            && !message.id.is_empty()
            && (self.store.contains_id(&message.id)
                || self.services.tracker.queue_of(&message.id).as_deref() == Some(&self.name))
        {
            self.reject(message, reply, PushResult::Duplicate).await;
            return;
        }

        if self.status == QueueStatus::Route {
            // Never stored: hand to the router layer and drop
            let _ = self.services.route_tx.send(RouteRequest {
                router: self.name.clone(),
                message,
                reply,
            });
            return;
        }

        let decision = self
            .pipeline
            .received_from_producer(&self.ctx, &message)
            .await;
        if !decision.allow {
            self.reject(message, reply, PushResult::Unacceptable).await;
            return;
        }
        if decision.save {
            let saved = self.pipeline.save_message(&self.ctx, &message).await;
            if !saved {
                let error = HmqError::Persistence(format!(
                    "Message '{}' not saved, staying volatile",
                    message.id
                ));
                self.pipeline
                    .exception_thrown(&self.ctx, "SaveMessage", &error)
                    .await;
            }
        }

        let message_flagged_ack = message.pending_acknowledge;
        let producer_awaits = message.pending_acknowledge || self.options.wait_for_ack;
        let message_id = message.id.clone();
        let accepted_source = message.source.clone();

        match self.store.push(message) {
            Ok(()) => {
                self.stats.received += 1;
                match self.options.acknowledge {
                    // Without consumer-ack tracking the push resolves at
                    // accept time; an explicit producer request is still
                    // answered
                    Acknowledge::None => {
                        self.resolve_reply_now(reply, PushResult::Ok);
                        if message_flagged_ack {
                            self.send_producer_ack(&accepted_source, &message_id, None).await;
                        }
                    }
                    Acknowledge::JustRequest => {
                        self.resolve_reply_now(reply, PushResult::Ok);
                        if producer_awaits {
                            self.send_producer_ack(&accepted_source, &message_id, None).await;
                        }
                    }
                    Acknowledge::WaitForAcknowledge => {
                        if let Some(reply) = reply {
                            self.pending_replies.insert(message_id, reply);
                        }
                    }
                }
            }
            Err(rejected) => {
                self.reject(rejected, reply, PushResult::Failed("limit".to_string()))
                    .await;
            }
        }
    }

    async fn reject(
        &mut self,
        message: Message,
        reply: Option<oneshot::Sender<PushResult>>,
        result: PushResult,
    ) {
        tracing::debug!(
            queue = %self.name,
            message_id = %message.id,
            reason = result.nack_reason(),
            "Push rejected"
        );
        self.stats.errors += 1;
        if message.pending_acknowledge || self.options.wait_for_ack {
            let reason = result.nack_reason().to_string();
            self.send_producer_ack(&message.source, &message.id, Some(&reason))
                .await;
        }
        self.resolve_reply_now(reply, result);
    }

    fn resolve_reply_now(&mut self, reply: Option<oneshot::Sender<PushResult>>, result: PushResult) {
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    /// Forward an acknowledge frame to a producer connection
    async fn send_producer_ack(&self, producer_id: &str, message_id: &str, reason: Option<&str>) {
        if producer_id.is_empty() {
            return;
        }
        let Some(producer) = self.services.registry.find_by_id(producer_id).await else {
            return;
        };
        let mut template = Message::queue(&self.name, 0);
        template.set_id(message_id);
        template.set_source(producer_id);
        let ack = template.create_acknowledge(reason);
        if let Err(error) = producer.send(&ack).await {
            tracing::debug!(queue = %self.name, producer = %producer_id, %error, "Producer ack undeliverable");
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────

    async fn dispatch(&mut self) {
        if !self.status.dispatches() {
            return;
        }
        loop {
            if self.store.is_empty() || self.subscribers.is_empty() {
                return;
            }
            let progressed = match self.status {
                QueueStatus::Broadcast => self.dispatch_broadcast().await,
                QueueStatus::RoundRobin => self.dispatch_single(true).await,
                QueueStatus::Running | QueueStatus::Push | QueueStatus::OnlyConsume => {
                    self.dispatch_single(false).await
                }
                _ => return,
            };
            if !progressed {
                return;
            }
        }
    }

    async fn dispatch_broadcast(&mut self) -> bool {
        let Some(queued) = self.store.pop() else {
            return false;
        };
        let message = queued.message;

        let decision = self.pipeline.begin_send(&self.ctx, &message).await;
        if !decision.allow {
            self.apply_keep(decision.keep, message, true).await;
            return true;
        }

        let candidates: Vec<ClientHandle> = self.subscribers.clone();
        let mut receivers = 0usize;
        let mut failed: Vec<String> = Vec::new();
        let mut requeue = false;

        for consumer in &candidates {
            let gate = self
                .pipeline
                .can_consumer_receive(&self.ctx, &message, consumer)
                .await;
            if !gate.allow {
                continue;
            }
            match self.write_to_consumer(&message, consumer, false).await {
                Ok(()) => {
                    receivers += 1;
                    self.stats.sent += 1;
                    let received = self
                        .pipeline
                        .consumer_received(&self.ctx, &message, consumer)
                        .await;
                    if received.save {
                        self.pipeline.save_message(&self.ctx, &message).await;
                    }
                    if message.first_acquirer_only {
                        break;
                    }
                }
                Err(error) => {
                    self.stats.errors += 1;
                    self.pipeline
                        .exception_thrown(&self.ctx, "ConsumerReceived", &error)
                        .await;
                    let failure = self
                        .pipeline
                        .consumer_receive_failed(&self.ctx, &message, consumer)
                        .await;
                    requeue |= failure.keep == KeepPolicy::RequeueHead && receivers == 0;
                    failed.push(consumer.id().to_string());
                }
            }
        }
        for id in failed {
            self.remove_subscriber(&id);
        }

        let end = self.pipeline.end_send(&self.ctx, &message, receivers).await;
        if receivers == 0 && (requeue || end.keep == KeepPolicy::RequeueHead) {
            self.store.requeue_front(message);
            return false;
        }

        // Broadcast deliveries are not consumer-ack tracked; the producer
        // outcome resolves at delivery time.
        self.finish_delivered(&message, receivers > 0).await;
        true
    }

    /// Dispatch the head message to one consumer. With `strict_order`
    /// (round-robin) the designated consumer is waited for when busy;
    /// otherwise the scan rotates to the next available subscriber.
    /// Returns true when the dispatch loop made progress.
    async fn dispatch_single(&mut self, strict_order: bool) -> bool {
        let count = self.subscribers.len();
        let Some(head) = self.store.peek().cloned() else {
            return false;
        };

        let begin = self.pipeline.begin_send(&self.ctx, &head).await;
        if !begin.allow {
            let Some(queued) = self.store.pop() else {
                return false;
            };
            self.apply_keep(begin.keep, queued.message, true).await;
            return true;
        }

        let start = if strict_order {
            self.rr_cursor % count
        } else {
            self.push_cursor % count
        };
        let mut earliest: Option<Instant> = None;
        let mut chosen = None;

        for offset in 0..count {
            let index = (start + offset) % count;
            let consumer = self.subscribers[index].clone();
            if !self.consumer_ready(&consumer) {
                if let Some(at) = self.next_allowed.get(consumer.id()) {
                    earliest = Some(earliest.map_or(*at, |e: Instant| e.min(*at)));
                }
                if strict_order {
                    // Cyclic fairness: wait for the designated consumer
                    break;
                }
                continue;
            }
            // Hook-gated consumers are skipped in both modes
            let gate = self
                .pipeline
                .can_consumer_receive(&self.ctx, &head, &consumer)
                .await;
            if !gate.allow {
                continue;
            }
            chosen = Some((index, consumer));
            break;
        }

        let Some((index, consumer)) = chosen else {
            if let Some(at) = earliest {
                self.schedule_wakeup_at(at);
            }
            return false;
        };

        let Some(queued) = self.store.pop() else {
            return false;
        };
        let message = queued.message;

        match self.write_to_consumer(&message, &consumer, true).await {
            Ok(()) => {
                self.stats.sent += 1;
                let received = self
                    .pipeline
                    .consumer_received(&self.ctx, &message, &consumer)
                    .await;
                if received.save {
                    self.pipeline.save_message(&self.ctx, &message).await;
                }
                if self.options.delay_between_messages_ms > 0 {
                    self.next_allowed.insert(
                        consumer.id().to_string(),
                        Instant::now()
                            + Duration::from_millis(self.options.delay_between_messages_ms),
                    );
                }

                if self.options.acknowledge == Acknowledge::WaitForAcknowledge {
                    let record = DeliveryRecord::for_ack(
                        message.clone(),
                        &self.name,
                        consumer.id(),
                        Some(message.source.clone()).filter(|s| !s.is_empty()),
                    );
                    let deadline =
                        Instant::now() + Duration::from_millis(self.options.ack_timeout_ms);
                    self.services
                        .tracker
                        .follow(record, deadline, self.expiry_tx.clone());
                    self.awaiting_ack.insert(consumer.id().to_string());
                    self.pipeline.end_send(&self.ctx, &message, 1).await;
                } else {
                    self.pipeline.end_send(&self.ctx, &message, 1).await;
                    self.finish_delivered(&message, true).await;
                }

                let count = self.subscribers.len().max(1);
                if strict_order {
                    self.rr_cursor = (index + 1) % count;
                } else {
                    self.push_cursor = (index + 1) % count;
                }
                true
            }
            Err(error) => {
                self.stats.errors += 1;
                self.pipeline
                    .exception_thrown(&self.ctx, "ConsumerReceived", &error)
                    .await;
                let failure = self
                    .pipeline
                    .consumer_receive_failed(&self.ctx, &message, &consumer)
                    .await;
                self.apply_keep(failure.keep, message, false).await;
                self.remove_subscriber(consumer.id());
                // Another subscriber may still take the message
                true
            }
        }
    }

    fn consumer_ready(&self, consumer: &ClientHandle) -> bool {
        if self.options.acknowledge == Acknowledge::WaitForAcknowledge
            && self.awaiting_ack.contains(consumer.id())
        {
            return false;
        }
        match self.next_allowed.get(consumer.id()) {
            Some(at) => *at <= Instant::now(),
            None => true,
        }
    }

    fn schedule_wakeup_at(&mut self, at: Instant) {
        if self.trigger_scheduled {
            return;
        }
        self.trigger_scheduled = true;
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at.into()).await;
            let _ = tx.send(QueueEvent::Trigger).await;
        });
    }

    /// Encode and write the outgoing frame for a consumer
    async fn write_to_consumer(
        &self,
        message: &Message,
        consumer: &ClientHandle,
        expect_ack: bool,
    ) -> Result<()> {
        let mut outgoing = message.clone();
        if self.options.hide_client_names {
            outgoing.set_source("");
        }
        // Consumers ack only when this queue tracks deliveries
        outgoing.pending_acknowledge =
            expect_ack && self.options.acknowledge == Acknowledge::WaitForAcknowledge;
        consumer.send(&outgoing).await
    }

    /// Final bookkeeping for a message that left the queue without a
    /// pending consumer ack
    async fn finish_delivered(&mut self, message: &Message, delivered: bool) {
        self.pipeline.message_dequeued(&self.ctx, message).await;
        if self.options.acknowledge == Acknowledge::WaitForAcknowledge {
            let result = if delivered {
                PushResult::Ok
            } else {
                PushResult::Failed("no-consumers".to_string())
            };
            if let Some(reply) = self.pending_replies.remove(&message.id) {
                let _ = reply.send(result.clone());
            }
            if message.pending_acknowledge || self.options.wait_for_ack {
                let reason = if result.is_ok() {
                    None
                } else {
                    Some(result.nack_reason().to_string())
                };
                self.send_producer_ack(&message.source, &message.id, reason.as_deref())
                    .await;
            }
        }
    }

    async fn apply_keep(&mut self, keep: KeepPolicy, message: Message, finalize_discard: bool) {
        match keep {
            KeepPolicy::RequeueHead => self.store.requeue_front(message),
            KeepPolicy::Retain => {
                let _ = self.store.push(message);
            }
            KeepPolicy::Discard => {
                if finalize_discard {
                    self.finish_delivered(&message, false).await;
                }
            }
        }
    }

    // ─── Pull ────────────────────────────────────────────────────────

    async fn handle_pull(&mut self, consumer: ClientHandle, request: Message) {
        if self.status != QueueStatus::Pull {
            let nack = request.create_acknowledge(Some("unacceptable"));
            let _ = consumer.send(&nack).await;
            return;
        }
        if self.store.is_empty() {
            let nack = request.create_acknowledge(Some("empty"));
            let _ = consumer.send(&nack).await;
            return;
        }

        let Some(queued) = self.store.pop() else {
            return;
        };
        let message = queued.message;

        let gate = self
            .pipeline
            .can_consumer_receive(&self.ctx, &message, &consumer)
            .await;
        if !gate.allow {
            self.store.requeue_front(message);
            let nack = request.create_acknowledge(Some("unauthorized"));
            let _ = consumer.send(&nack).await;
            return;
        }

        match self.write_to_consumer(&message, &consumer, true).await {
            Ok(()) => {
                self.stats.sent += 1;
                let received = self
                    .pipeline
                    .consumer_received(&self.ctx, &message, &consumer)
                    .await;
                if received.save {
                    self.pipeline.save_message(&self.ctx, &message).await;
                }
                if self.options.acknowledge == Acknowledge::WaitForAcknowledge {
                    let record = DeliveryRecord::for_ack(
                        message.clone(),
                        &self.name,
                        consumer.id(),
                        Some(message.source.clone()).filter(|s| !s.is_empty()),
                    );
                    let deadline =
                        Instant::now() + Duration::from_millis(self.options.ack_timeout_ms);
                    self.services
                        .tracker
                        .follow(record, deadline, self.expiry_tx.clone());
                    self.awaiting_ack.insert(consumer.id().to_string());
                } else {
                    self.finish_delivered(&message, true).await;
                }
            }
            Err(error) => {
                self.stats.errors += 1;
                let failure = self
                    .pipeline
                    .consumer_receive_failed(&self.ctx, &message, &consumer)
                    .await;
                self.pipeline
                    .exception_thrown(&self.ctx, "ConsumerReceived", &error)
                    .await;
                self.apply_keep(failure.keep, message, false).await;
            }
        }
    }

    // ─── Acks & timeouts ─────────────────────────────────────────────

    async fn handle_ack(&mut self, ack: Message) {
        let Some(record) = self.services.tracker.resolve_ack(&ack.id) else {
            // Late or unknown ack
            tracing::debug!(queue = %self.name, message_id = %ack.id, "Ignoring unmatched ack");
            return;
        };
        let success = !ack.is_negative_ack();
        self.awaiting_ack.remove(&record.consumer_id);

        if success {
            self.stats.acked += 1;
        } else {
            self.stats.nacked += 1;
        }

        let decision = self
            .pipeline
            .acknowledge_received(&self.ctx, &ack, &record, success)
            .await;

        // Forward the resolution to the producer when it awaits one
        if decision.ack != AckVote::Skip {
            let reason = if decision.ack == AckVote::Negative {
                Some(
                    ack.negative_ack_reason()
                        .unwrap_or(crate::message::NACK_REASON_NONE)
                        .to_string(),
                )
            } else {
                None
            };
            let result = match &reason {
                Some(reason) => PushResult::from_nack_reason(reason),
                None => PushResult::Ok,
            };
            if let Some(reply) = self.pending_replies.remove(&record.message_id) {
                let _ = reply.send(result);
            }
            if record.message.pending_acknowledge || self.options.wait_for_ack {
                if let Some(producer_id) = &record.producer_id {
                    self.send_producer_ack(producer_id, &record.message_id, reason.as_deref())
                        .await;
                }
            }
        }

        match decision.keep {
            KeepPolicy::RequeueHead => self.store.requeue_front(record.message),
            KeepPolicy::Retain => {
                let _ = self.store.push(record.message);
            }
            KeepPolicy::Discard => {
                self.pipeline.message_dequeued(&self.ctx, &record.message).await;
            }
        }
    }

    async fn handle_ack_timeout(&mut self, record: DeliveryRecord) {
        tracing::warn!(
            queue = %self.name,
            message_id = %record.message_id,
            consumer = %record.consumer_id,
            "Acknowledge timed out"
        );
        self.stats.timed_out += 1;
        self.awaiting_ack.remove(&record.consumer_id);

        let decision = self.pipeline.acknowledge_timed_out(&self.ctx, &record).await;

        if decision.ack == AckVote::Negative {
            if let Some(reply) = self.pending_replies.remove(&record.message_id) {
                let _ = reply.send(PushResult::Timeout);
            }
            if record.message.pending_acknowledge || self.options.wait_for_ack {
                if let Some(producer_id) = &record.producer_id {
                    self.send_producer_ack(producer_id, &record.message_id, Some("timeout"))
                        .await;
                }
            }
        }

        match decision.keep {
            KeepPolicy::RequeueHead => self.store.requeue_front(record.message),
            KeepPolicy::Retain => {
                let _ = self.store.push(record.message);
            }
            KeepPolicy::Discard => {
                self.pipeline.message_dequeued(&self.ctx, &record.message).await;
            }
        }
    }

    async fn sweep_timed_out(&mut self) {
        let timeout = Duration::from_millis(self.options.send_timeout_ms);
        let expired = self.store.take_expired(timeout);
        for queued in expired {
            let message = queued.message;
            tracing::debug!(queue = %self.name, message_id = %message.id, "Message timed out in queue");
            self.stats.timed_out += 1;
            let decision = self.pipeline.message_timed_out(&self.ctx, &message).await;
            match decision.keep {
                KeepPolicy::RequeueHead => {
                    self.store.requeue_front(message);
                    continue;
                }
                KeepPolicy::Retain => {
                    let _ = self.store.push(message);
                    continue;
                }
                KeepPolicy::Discard => {}
            }
            if decision.ack == AckVote::Negative {
                if let Some(reply) = self.pending_replies.remove(&message.id) {
                    let _ = reply.send(PushResult::Timeout);
                }
                if message.pending_acknowledge || self.options.wait_for_ack {
                    self.send_producer_ack(&message.source, &message.id, Some("timeout"))
                        .await;
                }
            }
            self.pipeline.message_dequeued(&self.ctx, &message).await;
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    async fn handle_client_lost(&mut self, client: ClientHandle, canceled: Vec<DeliveryRecord>) {
        for record in canceled {
            self.awaiting_ack.remove(&record.consumer_id);
            let failure = self
                .pipeline
                .consumer_receive_failed(&self.ctx, &record.message, &client)
                .await;
            match failure.keep {
                KeepPolicy::RequeueHead => self.store.requeue_front(record.message),
                KeepPolicy::Retain => {
                    let _ = self.store.push(record.message);
                }
                KeepPolicy::Discard => {
                    if let Some(reply) = self.pending_replies.remove(&record.message_id) {
                        let _ = reply.send(PushResult::SendError);
                    }
                    if record.message.pending_acknowledge || self.options.wait_for_ack {
                        if let Some(producer_id) = &record.producer_id {
                            self.send_producer_ack(
                                producer_id,
                                &record.message_id,
                                Some("send-error"),
                            )
                            .await;
                        }
                    }
                    self.pipeline
                        .message_dequeued(&self.ctx, &record.message)
                        .await;
                }
            }
        }
        self.remove_subscriber(client.id());
    }

    fn remove_subscriber(&mut self, client_id: &str) {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id() != client_id);
        if self.subscribers.len() != before {
            tracing::debug!(queue = %self.name, client = %client_id, "Unsubscribed");
            // Consumer drop resets the round-robin cursor
            self.rr_cursor = 0;
            if !self.subscribers.is_empty() {
                self.push_cursor %= self.subscribers.len();
            } else {
                self.push_cursor = 0;
            }
        }
        self.awaiting_ack.remove(client_id);
        self.next_allowed.remove(client_id);
    }

    fn check_auto_destroy(&mut self) {
        let trigger = match self.options.auto_destroy {
            AutoDestroy::Disabled => false,
            AutoDestroy::NoMessages => self.store.is_empty() && self.awaiting_ack.is_empty(),
            AutoDestroy::NoConsumers => self.subscribers.is_empty(),
            AutoDestroy::NoMessagesAndConsumers => {
                self.store.is_empty() && self.awaiting_ack.is_empty() && self.subscribers.is_empty()
            }
        };
        if trigger {
            let _ = self.services.remove_tx.send(self.name.clone());
        }
    }

    /// Cancel outstanding work and drain the store
    async fn shutdown(&mut self) {
        self.stopping = true;
        let canceled = self.services.tracker.cancel_by_queue(&self.name);
        for record in canceled {
            if let Some(reply) = self.pending_replies.remove(&record.message_id) {
                let _ = reply.send(PushResult::Failed("queue-removed".to_string()));
            }
            if record.message.pending_acknowledge || self.options.wait_for_ack {
                if let Some(producer_id) = &record.producer_id {
                    self.send_producer_ack(producer_id, &record.message_id, Some("queue-removed"))
                        .await;
                }
            }
        }
        for (_, reply) in self.pending_replies.drain() {
            let _ = reply.send(PushResult::Failed("queue-removed".to_string()));
        }
        for queued in self.store.drain() {
            self.pipeline
                .message_dequeued(&self.ctx, &queued.message)
                .await;
        }
        self.subscribers.clear();
    }
}
