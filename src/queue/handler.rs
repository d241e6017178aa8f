//! Delivery-handler pipeline — the decision hooks invoked at every queue event
//!
//! A [`DeliveryHandler`] is the only extension surface of the queue
//! engine. Handlers are invoked in registration order; each hook returns
//! a [`Decision`] and the engine applies the monotone fold of all of
//! them: `allow` is the conjunction, `save` the disjunction, and `ack` /
//! `keep` take the strongest vote. Behaviour variance between brokers
//! (non-durable, just-allow, persistent-ack, …) is expressed by picking
//! a handler composition, not by changing the engine.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::HmqError;
use crate::message::Message;
use crate::options::QueueOptions;
use crate::persist::QueueJournal;
use crate::registry::ClientHandle;
use crate::tracker::DeliveryRecord;

/// Producer-ack vote. The fold takes the strongest vote (`Negative`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum AckVote {
    /// No acknowledgement is forwarded
    #[default]
    Skip,
    /// Forward a positive acknowledgement
    Positive,
    /// Forward a negative acknowledgement
    Negative,
}

/// What to do with the message after the event. The fold takes the
/// strongest vote (`RequeueHead`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeepPolicy {
    /// Remove the message from the system
    #[default]
    Discard,
    /// Keep the message, appended at the tail of its lane
    Retain,
    /// Put the message back at the head of its lane
    RequeueHead,
}

/// Outcome of a single hook invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    pub save: bool,
    pub ack: AckVote,
    pub keep: KeepPolicy,
}

impl Decision {
    /// Allow, no save, no ack, discard
    pub fn allow() -> Self {
        Self {
            allow: true,
            save: false,
            ack: AckVote::Skip,
            keep: KeepPolicy::Discard,
        }
    }

    /// Deny the operation
    pub fn deny() -> Self {
        Self {
            allow: false,
            ..Self::allow()
        }
    }

    pub fn with_save(mut self) -> Self {
        self.save = true;
        self
    }

    pub fn with_ack(mut self, ack: AckVote) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_keep(mut self, keep: KeepPolicy) -> Self {
        self.keep = keep;
        self
    }

    /// Monotone fold of two decisions
    pub fn merge(self, other: Decision) -> Decision {
        Decision {
            allow: self.allow && other.allow,
            save: self.save || other.save,
            ack: self.ack.max(other.ack),
            keep: self.keep.max(other.keep),
        }
    }
}

impl Default for Decision {
    fn default() -> Self {
        Self::allow()
    }
}

/// Per-queue context handed to every hook
///
/// Handlers receive their context as a parameter; they never hold a
/// queue pointer.
pub struct QueueContext {
    /// Queue name (lowercased)
    pub queue: String,

    /// Options in effect for this event
    pub options: QueueOptions,

    /// The queue's journal, when the queue is durable. The file is owned
    /// by the queue's actor; hooks only touch it from within that actor's
    /// event processing.
    pub journal: Option<Arc<Mutex<QueueJournal>>>,
}

/// The hook set invoked by the queue engine
///
/// Every hook has a default that keeps the engine's baseline behaviour:
/// allow everything, persist nothing, forward acks as received, requeue
/// on failed writes, discard on resolution.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Before accepting a message into the queue
    async fn received_from_producer(&self, _ctx: &QueueContext, _message: &Message) -> Decision {
        Decision::allow()
    }

    /// About to hand a message to consumers
    async fn begin_send(&self, _ctx: &QueueContext, _message: &Message) -> Decision {
        Decision::allow()
    }

    /// Per-consumer gate
    async fn can_consumer_receive(
        &self,
        _ctx: &QueueContext,
        _message: &Message,
        _consumer: &ClientHandle,
    ) -> Decision {
        Decision::allow()
    }

    /// The frame was written to the consumer's socket
    async fn consumer_received(
        &self,
        _ctx: &QueueContext,
        _message: &Message,
        _consumer: &ClientHandle,
    ) -> Decision {
        Decision::allow()
    }

    /// The write to the consumer failed
    async fn consumer_receive_failed(
        &self,
        _ctx: &QueueContext,
        _message: &Message,
        _consumer: &ClientHandle,
    ) -> Decision {
        Decision::allow().with_keep(KeepPolicy::RequeueHead)
    }

    /// All candidate consumers were processed
    async fn end_send(
        &self,
        _ctx: &QueueContext,
        _message: &Message,
        _receivers: usize,
    ) -> Decision {
        Decision::allow()
    }

    /// A positive or negative acknowledge arrived for a tracked delivery
    async fn acknowledge_received(
        &self,
        _ctx: &QueueContext,
        _ack: &Message,
        _record: &DeliveryRecord,
        success: bool,
    ) -> Decision {
        let ack = if success {
            AckVote::Positive
        } else {
            AckVote::Negative
        };
        Decision::allow().with_ack(ack)
    }

    /// A message sat in the queue past `send_timeout_ms`
    async fn message_timed_out(&self, _ctx: &QueueContext, _message: &Message) -> Decision {
        Decision::allow().with_ack(AckVote::Negative)
    }

    /// A tracked delivery expired without an acknowledge
    async fn acknowledge_timed_out(
        &self,
        _ctx: &QueueContext,
        _record: &DeliveryRecord,
    ) -> Decision {
        Decision::allow().with_ack(AckVote::Negative)
    }

    /// The message left the system. Side effects only.
    async fn message_dequeued(&self, _ctx: &QueueContext, _message: &Message) {}

    /// A hook or I/O operation failed
    async fn exception_thrown(&self, _ctx: &QueueContext, _hook: &str, _error: &HmqError) {}

    /// Persistence write-through; returns whether the message was saved
    async fn save_message(&self, _ctx: &QueueContext, _message: &Message) -> bool {
        false
    }
}

/// Ordered set of handlers folded into one decision per hook
#[derive(Default)]
pub struct HandlerPipeline {
    handlers: Vec<Arc<dyn DeliveryHandler>>,
}

impl HandlerPipeline {
    pub fn new(handlers: Vec<Arc<dyn DeliveryHandler>>) -> Self {
        Self { handlers }
    }

    pub fn push(&mut self, handler: Arc<dyn DeliveryHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn received_from_producer(&self, ctx: &QueueContext, message: &Message) -> Decision {
        let mut folded = Decision::allow();
        for handler in &self.handlers {
            folded = folded.merge(handler.received_from_producer(ctx, message).await);
        }
        folded
    }

    pub async fn begin_send(&self, ctx: &QueueContext, message: &Message) -> Decision {
        let mut folded = Decision::allow();
        for handler in &self.handlers {
            folded = folded.merge(handler.begin_send(ctx, message).await);
        }
        folded
    }

    pub async fn can_consumer_receive(
        &self,
        ctx: &QueueContext,
        message: &Message,
        consumer: &ClientHandle,
    ) -> Decision {
        let mut folded = Decision::allow();
        for handler in &self.handlers {
            folded = folded.merge(handler.can_consumer_receive(ctx, message, consumer).await);
        }
        folded
    }

    pub async fn consumer_received(
        &self,
        ctx: &QueueContext,
        message: &Message,
        consumer: &ClientHandle,
    ) -> Decision {
        let mut folded = Decision::allow();
        for handler in &self.handlers {
            folded = folded.merge(handler.consumer_received(ctx, message, consumer).await);
        }
        folded
    }

    pub async fn consumer_receive_failed(
        &self,
        ctx: &QueueContext,
        message: &Message,
        consumer: &ClientHandle,
    ) -> Decision {
        let mut folded = Decision::allow();
        for handler in &self.handlers {
            folded = folded.merge(
                handler
                    .consumer_receive_failed(ctx, message, consumer)
                    .await,
            );
        }
        folded
    }

    pub async fn end_send(
        &self,
        ctx: &QueueContext,
        message: &Message,
        receivers: usize,
    ) -> Decision {
        let mut folded = Decision::allow();
        for handler in &self.handlers {
            folded = folded.merge(handler.end_send(ctx, message, receivers).await);
        }
        folded
    }

    pub async fn acknowledge_received(
        &self,
        ctx: &QueueContext,
        ack: &Message,
        record: &DeliveryRecord,
        success: bool,
    ) -> Decision {
        let mut folded = Decision::allow();
        for handler in &self.handlers {
            folded = folded.merge(
                handler
                    .acknowledge_received(ctx, ack, record, success)
                    .await,
            );
        }
        folded
    }

    pub async fn message_timed_out(&self, ctx: &QueueContext, message: &Message) -> Decision {
        let mut folded = Decision::allow();
        for handler in &self.handlers {
            folded = folded.merge(handler.message_timed_out(ctx, message).await);
        }
        folded
    }

    pub async fn acknowledge_timed_out(
        &self,
        ctx: &QueueContext,
        record: &DeliveryRecord,
    ) -> Decision {
        let mut folded = Decision::allow();
        for handler in &self.handlers {
            folded = folded.merge(handler.acknowledge_timed_out(ctx, record).await);
        }
        folded
    }

    pub async fn message_dequeued(&self, ctx: &QueueContext, message: &Message) {
        for handler in &self.handlers {
            handler.message_dequeued(ctx, message).await;
        }
    }

    pub async fn exception_thrown(&self, ctx: &QueueContext, hook: &str, error: &HmqError) {
        for handler in &self.handlers {
            handler.exception_thrown(ctx, hook, error).await;
        }
    }

    /// True when any handler reports the message saved
    pub async fn save_message(&self, ctx: &QueueContext, message: &Message) -> bool {
        let mut saved = false;
        for handler in &self.handlers {
            saved |= handler.save_message(ctx, message).await;
        }
        saved
    }
}

/// Baseline handler: allow everything, never persist
pub struct JustAllowHandler;

#[async_trait]
impl DeliveryHandler for JustAllowHandler {}

/// Reliable-delivery handler: requeue on negative acks and, optionally,
/// on ack timeouts
pub struct AckDeliveryHandler {
    pub requeue_on_negative: bool,
    pub requeue_on_timeout: bool,
}

impl Default for AckDeliveryHandler {
    fn default() -> Self {
        Self {
            requeue_on_negative: true,
            requeue_on_timeout: false,
        }
    }
}

#[async_trait]
impl DeliveryHandler for AckDeliveryHandler {
    async fn acknowledge_received(
        &self,
        _ctx: &QueueContext,
        _ack: &Message,
        _record: &DeliveryRecord,
        success: bool,
    ) -> Decision {
        if success {
            Decision::allow().with_ack(AckVote::Positive)
        } else {
            let keep = if self.requeue_on_negative {
                KeepPolicy::RequeueHead
            } else {
                KeepPolicy::Discard
            };
            Decision::allow().with_ack(AckVote::Negative).with_keep(keep)
        }
    }

    async fn acknowledge_timed_out(
        &self,
        _ctx: &QueueContext,
        _record: &DeliveryRecord,
    ) -> Decision {
        let keep = if self.requeue_on_timeout {
            KeepPolicy::RequeueHead
        } else {
            KeepPolicy::Discard
        };
        Decision::allow().with_ack(AckVote::Negative).with_keep(keep)
    }
}

/// Durable handler: vote save on accept, write through the queue journal,
/// tombstone on final removal
pub struct DurableDeliveryHandler;

#[async_trait]
impl DeliveryHandler for DurableDeliveryHandler {
    async fn received_from_producer(&self, _ctx: &QueueContext, _message: &Message) -> Decision {
        Decision::allow().with_save()
    }

    async fn save_message(&self, ctx: &QueueContext, message: &Message) -> bool {
        let Some(journal) = &ctx.journal else {
            return false;
        };
        match journal.lock().await.insert(message) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    queue = %ctx.queue,
                    message_id = %message.id,
                    %error,
                    "Journal write failed, message stays volatile"
                );
                false
            }
        }
    }

    async fn message_dequeued(&self, ctx: &QueueContext, message: &Message) {
        let Some(journal) = &ctx.journal else {
            return;
        };
        if message.id.is_empty() {
            return;
        }
        if let Err(error) = journal.lock().await.remove(&message.id) {
            tracing::warn!(
                queue = %ctx.queue,
                message_id = %message.id,
                %error,
                "Journal tombstone write failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> QueueContext {
        QueueContext {
            queue: "orders".to_string(),
            options: QueueOptions::default(),
            journal: None,
        }
    }

    fn record() -> DeliveryRecord {
        DeliveryRecord::for_ack(
            Message::queue("orders", 1),
            "orders",
            "consumer-1",
            Some("producer-1".to_string()),
        )
    }

    #[test]
    fn test_merge_is_monotone() {
        let allow = Decision::allow();
        let deny = Decision::deny();
        assert!(!allow.merge(deny).allow);
        assert!(!deny.merge(allow).allow);

        let saving = Decision::allow().with_save();
        assert!(allow.merge(saving).save);

        let positive = Decision::allow().with_ack(AckVote::Positive);
        let negative = Decision::allow().with_ack(AckVote::Negative);
        assert_eq!(positive.merge(negative).ack, AckVote::Negative);
        assert_eq!(negative.merge(positive).ack, AckVote::Negative);

        let retain = Decision::allow().with_keep(KeepPolicy::Retain);
        let requeue = Decision::allow().with_keep(KeepPolicy::RequeueHead);
        assert_eq!(retain.merge(requeue).keep, KeepPolicy::RequeueHead);
    }

    #[tokio::test]
    async fn test_pipeline_folds_in_registration_order() {
        struct Denier;
        #[async_trait]
        impl DeliveryHandler for Denier {
            async fn received_from_producer(
                &self,
                _ctx: &QueueContext,
                _message: &Message,
            ) -> Decision {
                Decision::deny()
            }
        }

        let pipeline = HandlerPipeline::new(vec![
            Arc::new(JustAllowHandler),
            Arc::new(Denier),
            Arc::new(DurableDeliveryHandler),
        ]);

        let decision = pipeline
            .received_from_producer(&ctx(), &Message::queue("orders", 1))
            .await;
        assert!(!decision.allow);
        // The durable handler's save vote survives the denial
        assert!(decision.save);
    }

    #[tokio::test]
    async fn test_default_ack_passthrough() {
        let pipeline = HandlerPipeline::new(vec![Arc::new(JustAllowHandler)]);
        let ack = Message::queue("orders", 1).create_acknowledge(None);

        let positive = pipeline
            .acknowledge_received(&ctx(), &ack, &record(), true)
            .await;
        assert_eq!(positive.ack, AckVote::Positive);
        assert_eq!(positive.keep, KeepPolicy::Discard);

        let negative = pipeline
            .acknowledge_received(&ctx(), &ack, &record(), false)
            .await;
        assert_eq!(negative.ack, AckVote::Negative);
    }

    #[tokio::test]
    async fn test_ack_handler_requeues_on_negative() {
        let pipeline = HandlerPipeline::new(vec![Arc::new(AckDeliveryHandler::default())]);
        let ack = Message::queue("orders", 1).create_acknowledge(Some("busy"));

        let decision = pipeline
            .acknowledge_received(&ctx(), &ack, &record(), false)
            .await;
        assert_eq!(decision.keep, KeepPolicy::RequeueHead);
        assert_eq!(decision.ack, AckVote::Negative);

        let timeout = pipeline.acknowledge_timed_out(&ctx(), &record()).await;
        assert_eq!(timeout.keep, KeepPolicy::Discard);
        assert_eq!(timeout.ack, AckVote::Negative);
    }

    #[tokio::test]
    async fn test_default_receive_failed_requeues() {
        let pipeline = HandlerPipeline::new(vec![Arc::new(JustAllowHandler)]);
        let (consumer, _rx) = ClientHandle::channel("c1", "w", "t");
        let decision = pipeline
            .consumer_receive_failed(&ctx(), &Message::queue("orders", 1), &consumer)
            .await;
        assert_eq!(decision.keep, KeepPolicy::RequeueHead);
    }

    #[tokio::test]
    async fn test_save_without_journal_reports_unsaved() {
        let pipeline = HandlerPipeline::new(vec![Arc::new(DurableDeliveryHandler)]);
        let saved = pipeline
            .save_message(&ctx(), &Message::queue("orders", 1))
            .await;
        assert!(!saved);
    }
}
