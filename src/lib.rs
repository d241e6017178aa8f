//! # hmq
//!
//! Message-queue broker and client library speaking the HMQ binary
//! framing protocol over TCP.
//!
//! ## Overview
//!
//! Producers push messages into named queues; consumers subscribe and
//! receive them with configurable acknowledgement, ordering, persistence,
//! and routing semantics. Direct client-to-client messages, request /
//! response correlation, and router/binding fan-out ride the same
//! connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hmq::{Broker, BrokerOptions, HmqClient, ClientOptions};
//!
//! # async fn example() -> hmq::Result<()> {
//! // Serve a broker
//! let broker = Broker::new(BrokerOptions::default());
//! let addr = broker.listen("127.0.0.1:0").await?;
//!
//! // Connect, subscribe, push
//! let consumer = HmqClient::connect(&addr.to_string(), ClientOptions::default()).await?;
//! let mut stream = consumer.subscribe("orders").await?;
//!
//! let producer = HmqClient::connect(&addr.to_string(), ClientOptions::default()).await?;
//! producer.push("orders", "Hello, World!", false).await?;
//!
//! let message = stream.recv().await.unwrap();
//! println!("received: {}", message.content_string());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Broker** — process state: queues, clients, routers, accept loop
//! - **Queue engine** — one single-writer actor per queue; status machine
//!   drives push/pull/broadcast/round-robin dispatch
//! - **DeliveryHandler** — hook pipeline consulted on every queue event
//! - **DeliveryTracker** — pending-ack / pending-response deadlines
//! - **Router** — priority-ordered bindings fanning out to queues and
//!   client sets
//! - **QueueJournal** — per-queue append-only persistence with replay

pub mod broker;
pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod options;
pub mod persist;
pub mod queue;
pub mod registry;
pub mod router;
pub mod tracker;

// Re-export core types
pub use broker::{Broker, HandlerFactory};
pub use client::{ClientOptions, ConsumerDescriptor, HmqClient, MessageConsumer};
pub use error::{HmqError, Result};
pub use message::{Message, MessageType};
pub use options::{
    Acknowledge, AutoDestroy, BrokerOptions, PushResult, QueueOptions, QueueStatus,
};
pub use queue::handler::{
    AckDeliveryHandler, AckVote, Decision, DeliveryHandler, DurableDeliveryHandler,
    HandlerPipeline, JustAllowHandler, KeepPolicy, QueueContext,
};
pub use queue::{QueueHandle, QueueInfo, QueueStats};
pub use registry::{ClientHandle, ClientInfo, ClientRegistry};
pub use router::{Binding, BindingInteraction, BindingTarget, Router};
pub use tracker::{DeliveryRecord, DeliveryTracker, TrackKind};
