//! Queue and broker option types
//!
//! All types use camelCase JSON serialization so option payloads can be
//! carried in `CreateQueue` frames and configuration files alike.

use serde::{Deserialize, Serialize};

/// Acknowledgement policy of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Acknowledge {
    /// No consumer-ack tracking; an explicit producer ack request is
    /// still answered at accept time
    #[default]
    None,
    /// Producers are acknowledged as soon as the push is accepted
    JustRequest,
    /// Producers are acknowledged after the consumer resolves the delivery
    WaitForAcknowledge,
}

/// Automatic queue removal policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutoDestroy {
    #[default]
    Disabled,
    /// Remove when the queue has no messages and no consumers
    NoMessagesAndConsumers,
    /// Remove when the queue has no messages
    NoMessages,
    /// Remove when the queue has no consumers
    NoConsumers,
}

/// Queue state machine states
///
/// The status selects both lifecycle (accept/deny pushes and dispatch)
/// and dispatch strategy. `Running` dispatches like `Push`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueStatus {
    /// Accept pushes; dispatch on push and on subscribe
    #[default]
    Running,
    /// Accept pushes; no dispatch
    Paused,
    /// Pushes denied; dispatch allowed
    OnlyConsume,
    /// Accept pushes; dispatch denied
    OnlyPush,
    /// Drops everything, rejects operations
    Stopped,
    /// Never stores; passes immediately to the router and drops
    Route,
    /// Stores; dispatches only on explicit pull requests
    Pull,
    /// One message to the next subscriber in subscription order
    RoundRobin,
    /// Each message to every subscriber passing the per-consumer gate
    Broadcast,
    /// Each message to a single next-available subscriber
    Push,
}

impl QueueStatus {
    /// Whether this status accepts producer pushes
    pub fn accepts_push(&self) -> bool {
        !matches!(self, QueueStatus::OnlyConsume | QueueStatus::Stopped)
    }

    /// Whether this status dispatches spontaneously on push/subscribe
    pub fn dispatches(&self) -> bool {
        matches!(
            self,
            QueueStatus::Running
                | QueueStatus::OnlyConsume
                | QueueStatus::RoundRobin
                | QueueStatus::Broadcast
                | QueueStatus::Push
        )
    }
}

/// Per-queue options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueOptions {
    /// Acknowledgement policy
    pub acknowledge: Acknowledge,

    /// How long a message may stay queued before `MessageTimedOut`
    /// fires, in milliseconds. Zero disables the timeout.
    pub send_timeout_ms: u64,

    /// How long a tracked delivery may wait for its consumer ack,
    /// in milliseconds
    pub ack_timeout_ms: u64,

    /// Maximum number of stored messages. Zero means unlimited.
    pub message_limit: usize,

    /// Maximum content size per message in bytes. Zero means unlimited.
    pub message_size_limit: usize,

    /// Minimum gap between consecutive sends to the same consumer,
    /// in milliseconds
    pub delay_between_messages_ms: u64,

    /// Assign generated ids to messages pushed without one
    pub use_message_id: bool,

    /// Producers pushing with the pending-acknowledge flag are answered
    pub wait_for_ack: bool,

    /// Blank the source field before handing messages to consumers
    pub hide_client_names: bool,

    /// Initial status
    pub status: QueueStatus,

    /// Automatic removal policy
    pub auto_destroy: AutoDestroy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            acknowledge: Acknowledge::None,
            send_timeout_ms: 0,
            ack_timeout_ms: 5_000,
            message_limit: 0,
            message_size_limit: 0,
            delay_between_messages_ms: 0,
            use_message_id: true,
            wait_for_ack: false,
            hide_client_names: false,
            status: QueueStatus::Running,
            auto_destroy: AutoDestroy::Disabled,
        }
    }
}

/// Broker-wide options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerOptions {
    /// Broker instance name
    pub name: String,

    /// Create queues on first use instead of rejecting unknown targets
    pub auto_queue_creation: bool,

    /// Options applied to auto-created queues
    pub default_queue_options: QueueOptions,

    /// Deadline for tracked responses, in milliseconds
    pub response_timeout_ms: u64,

    /// Maximum connected clients. Zero means unlimited.
    pub client_limit: usize,

    /// Blank client names in list responses
    pub hide_client_names: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            name: "hmq".to_string(),
            auto_queue_creation: true,
            default_queue_options: QueueOptions::default(),
            response_timeout_ms: 30_000,
            client_limit: 0,
            hide_client_names: false,
        }
    }
}

/// Producer-visible outcome of a push
///
/// Negative acknowledgements from consumers surface as `Failed` with the
/// reason carried by the `Negative-Ack` header. The other variants map
/// broker-generated rejections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushResult {
    Ok,
    /// Rejected or negatively acknowledged, with the nack reason
    Failed(String),
    SendError,
    Unauthorized,
    Unacceptable,
    Busy,
    NotFound,
    Timeout,
    Duplicate,
}

impl PushResult {
    /// Map a negative-ack reason to a result
    ///
    /// Broker-generated reasons map to their dedicated variants;
    /// consumer-provided reasons surface as `Failed(reason)`.
    pub fn from_nack_reason(reason: &str) -> Self {
        match reason {
            "unauthorized" => PushResult::Unauthorized,
            "unacceptable" => PushResult::Unacceptable,
            "not-found" => PushResult::NotFound,
            "duplicate" => PushResult::Duplicate,
            "timeout" => PushResult::Timeout,
            "send-error" => PushResult::SendError,
            other => PushResult::Failed(other.to_string()),
        }
    }

    /// The nack reason to carry for this result
    pub fn nack_reason(&self) -> &str {
        match self {
            PushResult::Ok => crate::message::NACK_REASON_NONE,
            PushResult::Failed(reason) => reason,
            PushResult::SendError => "send-error",
            PushResult::Unauthorized => "unauthorized",
            PushResult::Unacceptable => "unacceptable",
            PushResult::Busy => "busy",
            PushResult::NotFound => "not-found",
            PushResult::Timeout => "timeout",
            PushResult::Duplicate => "duplicate",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PushResult::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_options_defaults() {
        let options = QueueOptions::default();
        assert_eq!(options.acknowledge, Acknowledge::None);
        assert_eq!(options.status, QueueStatus::Running);
        assert_eq!(options.ack_timeout_ms, 5_000);
        assert_eq!(options.message_limit, 0);
        assert!(options.use_message_id);
        assert_eq!(options.auto_destroy, AutoDestroy::Disabled);
    }

    #[test]
    fn test_queue_options_serialization() {
        let mut options = QueueOptions::default();
        options.acknowledge = Acknowledge::WaitForAcknowledge;
        options.message_limit = 100;
        options.status = QueueStatus::RoundRobin;

        let json = serde_json::to_string(&options).unwrap();
        assert!(json.contains("\"acknowledge\":\"waitForAcknowledge\""));
        assert!(json.contains("\"messageLimit\":100"));
        assert!(json.contains("\"status\":\"roundRobin\""));

        let parsed: QueueOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.acknowledge, Acknowledge::WaitForAcknowledge);
        assert_eq!(parsed.status, QueueStatus::RoundRobin);
    }

    #[test]
    fn test_queue_options_partial_deserialization() {
        // Options payloads may carry only the fields they change
        let options: QueueOptions =
            serde_json::from_str(r#"{"messageLimit": 2, "status": "pull"}"#).unwrap();
        assert_eq!(options.message_limit, 2);
        assert_eq!(options.status, QueueStatus::Pull);
        assert_eq!(options.acknowledge, Acknowledge::None);
    }

    #[test]
    fn test_status_push_and_dispatch_rules() {
        assert!(QueueStatus::Running.accepts_push());
        assert!(QueueStatus::Paused.accepts_push());
        assert!(!QueueStatus::OnlyConsume.accepts_push());
        assert!(!QueueStatus::Stopped.accepts_push());

        assert!(QueueStatus::Running.dispatches());
        assert!(QueueStatus::Broadcast.dispatches());
        assert!(!QueueStatus::Paused.dispatches());
        assert!(!QueueStatus::OnlyPush.dispatches());
        assert!(!QueueStatus::Pull.dispatches());
        assert!(!QueueStatus::Stopped.dispatches());
    }

    #[test]
    fn test_push_result_reason_mapping() {
        assert_eq!(
            PushResult::from_nack_reason("busy"),
            PushResult::Failed("busy".to_string())
        );
        assert_eq!(
            PushResult::from_nack_reason("limit"),
            PushResult::Failed("limit".to_string())
        );
        assert_eq!(PushResult::from_nack_reason("timeout"), PushResult::Timeout);
        assert_eq!(
            PushResult::from_nack_reason("duplicate"),
            PushResult::Duplicate
        );

        assert_eq!(PushResult::Busy.nack_reason(), "busy");
        assert_eq!(PushResult::Failed("limit".into()).nack_reason(), "limit");
    }
}
