//! Router & bindings — rule-based fan-out to queues and client sets
//!
//! A router owns an ordered list of bindings, lowest priority value
//! first (ties keep insertion order). Routing walks the bindings in
//! order; each forwards the message to its target and reports success.
//! Queue bindings cache their resolved queue handle for up to 60 s; a
//! queue deleted inside that window is detected as a dead handle and
//! treated as a cache miss.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::broker::Broker;
use crate::message::Message;
use crate::options::PushResult;
use crate::queue::QueueHandle;

/// How long a queue binding trusts its resolved handle
const QUEUE_CACHE_TTL: Duration = Duration::from_secs(60);

/// What a binding forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingTarget {
    /// A queue by name (resolved through the broker, may auto-create)
    Queue(String),
    /// All clients with the given name
    ClientName(String),
    /// All clients of the given type
    ClientType(String),
}

/// Whether the router awaits a reply before returning to the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindingInteraction {
    #[default]
    None,
    Response,
    Acknowledge,
}

/// A single routing rule
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub target: BindingTarget,
    /// Lower fires first
    pub priority: u16,
    /// Deliver to only the first receiver found in registry scan order
    pub first_receiver_only: bool,
    pub interaction: BindingInteraction,
}

impl Binding {
    pub fn to_queue(name: impl Into<String>, queue: impl Into<String>, priority: u16) -> Self {
        Self {
            name: name.into(),
            target: BindingTarget::Queue(queue.into()),
            priority,
            first_receiver_only: false,
            interaction: BindingInteraction::None,
        }
    }

    pub fn to_clients(name: impl Into<String>, client_name: impl Into<String>, priority: u16) -> Self {
        Self {
            name: name.into(),
            target: BindingTarget::ClientName(client_name.into()),
            priority,
            first_receiver_only: false,
            interaction: BindingInteraction::None,
        }
    }

    pub fn with_interaction(mut self, interaction: BindingInteraction) -> Self {
        self.interaction = interaction;
        self
    }

    pub fn only_first_receiver(mut self) -> Self {
        self.first_receiver_only = true;
        self
    }
}

struct CachedQueue {
    handle: QueueHandle,
    resolved_at: Instant,
}

/// A named router with its ordered bindings
pub struct Router {
    name: String,
    bindings: RwLock<Vec<Binding>>,
    queue_cache: Mutex<HashMap<String, CachedQueue>>,
}

impl Router {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: RwLock::new(Vec::new()),
            queue_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a binding, keeping the list sorted by priority.
    /// Equal priorities keep insertion order.
    pub async fn add_binding(&self, binding: Binding) {
        let mut bindings = self.bindings.write().await;
        let position = bindings
            .iter()
            .position(|existing| existing.priority > binding.priority)
            .unwrap_or(bindings.len());
        bindings.insert(position, binding);
    }

    pub async fn remove_binding(&self, name: &str) -> bool {
        let mut bindings = self.bindings.write().await;
        let before = bindings.len();
        bindings.retain(|binding| binding.name != name);
        bindings.len() != before
    }

    pub async fn bindings(&self) -> Vec<Binding> {
        self.bindings.read().await.clone()
    }

    /// Route a message through the bindings in priority order.
    ///
    /// A message flagged `first_acquirer_only` stops at the first binding
    /// that acquires it, whether or not the delivery then succeeds.
    /// Returns `Ok` when at least one binding delivered, `NotFound` when
    /// nothing matched.
    pub async fn route(&self, broker: &Broker, mut message: Message) -> PushResult {
        message.ttl -= 1;
        if message.ttl < 0 {
            tracing::debug!(router = %self.name, message_id = %message.id, "Dropped on ttl");
            return PushResult::Failed("ttl-exceeded".to_string());
        }

        let bindings = self.bindings.read().await.clone();
        if bindings.is_empty() {
            return PushResult::NotFound;
        }

        let mut delivered = 0usize;
        let mut matched = 0usize;
        let mut last_failure: Option<PushResult> = None;

        for binding in &bindings {
            let outcome = self.apply_binding(broker, binding, &message).await;
            match outcome {
                BindingOutcome::NoTarget => continue,
                BindingOutcome::Delivered => {
                    matched += 1;
                    delivered += 1;
                }
                BindingOutcome::Failed(result) => {
                    matched += 1;
                    last_failure = Some(result);
                }
            }
            if message.first_acquirer_only && matched > 0 {
                break;
            }
        }

        if delivered > 0 {
            PushResult::Ok
        } else if matched > 0 {
            last_failure.unwrap_or(PushResult::SendError)
        } else {
            PushResult::NotFound
        }
    }

    async fn apply_binding(
        &self,
        broker: &Broker,
        binding: &Binding,
        message: &Message,
    ) -> BindingOutcome {
        match &binding.target {
            BindingTarget::Queue(queue_name) => {
                let Some(handle) = self.resolve_queue(broker, queue_name).await else {
                    return BindingOutcome::NoTarget;
                };
                let mut copy = message.clone();
                copy.set_target(queue_name.clone());
                let retry = copy.clone();

                let result = match binding.interaction {
                    BindingInteraction::Acknowledge => match handle.push(copy).await {
                        Ok(result) => result,
                        Err(_) => {
                            // Dead handle: the queue went away inside the
                            // cache window. Treat as a miss and retry once.
                            self.invalidate(queue_name).await;
                            match self.resolve_queue(broker, queue_name).await {
                                Some(fresh) => {
                                    fresh.push(retry).await.unwrap_or(PushResult::NotFound)
                                }
                                None => PushResult::NotFound,
                            }
                        }
                    },
                    _ => match handle.enqueue(copy).await {
                        Ok(()) => PushResult::Ok,
                        Err(_) => {
                            self.invalidate(queue_name).await;
                            match self.resolve_queue(broker, queue_name).await {
                                Some(fresh) => match fresh.enqueue(retry).await {
                                    Ok(()) => PushResult::Ok,
                                    Err(_) => PushResult::NotFound,
                                },
                                None => PushResult::NotFound,
                            }
                        }
                    },
                };
                if result.is_ok() {
                    BindingOutcome::Delivered
                } else {
                    BindingOutcome::Failed(result)
                }
            }
            BindingTarget::ClientName(name) => {
                let clients = broker.registry().find_by_name(name).await;
                self.send_to_clients(binding, message, clients).await
            }
            BindingTarget::ClientType(client_type) => {
                let clients = broker.registry().find_by_type(client_type).await;
                self.send_to_clients(binding, message, clients).await
            }
        }
    }

    async fn send_to_clients(
        &self,
        binding: &Binding,
        message: &Message,
        clients: Vec<crate::registry::ClientHandle>,
    ) -> BindingOutcome {
        if clients.is_empty() {
            return BindingOutcome::NoTarget;
        }
        let mut sent = 0usize;
        for client in &clients {
            if client.send(message).await.is_ok() {
                sent += 1;
                if binding.first_receiver_only || message.first_acquirer_only {
                    break;
                }
            }
        }
        if sent > 0 {
            BindingOutcome::Delivered
        } else {
            BindingOutcome::Failed(PushResult::SendError)
        }
    }

    /// Resolve a queue handle through the cache, the live map, or
    /// auto-creation (when the broker allows it)
    async fn resolve_queue(&self, broker: &Broker, queue_name: &str) -> Option<QueueHandle> {
        {
            let cache = self.queue_cache.lock().await;
            if let Some(cached) = cache.get(queue_name) {
                if cached.resolved_at.elapsed() < QUEUE_CACHE_TTL {
                    return Some(cached.handle.clone());
                }
            }
        }

        let handle = match broker.find_queue(queue_name).await {
            Some(handle) => Some(handle),
            None => broker.try_auto_create(queue_name).await,
        }?;

        let mut cache = self.queue_cache.lock().await;
        cache.insert(
            queue_name.to_string(),
            CachedQueue {
                handle: handle.clone(),
                resolved_at: Instant::now(),
            },
        );
        Some(handle)
    }

    async fn invalidate(&self, queue_name: &str) {
        self.queue_cache.lock().await.remove(queue_name);
    }
}

enum BindingOutcome {
    /// No target matched this binding
    NoTarget,
    Delivered,
    Failed(PushResult),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::options::{BrokerOptions, QueueOptions};

    fn message(content: &str) -> Message {
        let mut message = Message::new(crate::message::MessageType::Router);
        message.set_id(format!("r-{}", content));
        message.set_target("ingest");
        message.set_string_content(content);
        message
    }

    #[tokio::test]
    async fn test_bindings_ordered_by_priority() {
        let router = Router::new("ingest");
        router.add_binding(Binding::to_queue("late", "c", 30)).await;
        router.add_binding(Binding::to_queue("first", "a", 5)).await;
        router.add_binding(Binding::to_queue("mid", "b", 10)).await;
        router.add_binding(Binding::to_queue("mid2", "b2", 10)).await;

        let names: Vec<String> = router
            .bindings()
            .await
            .into_iter()
            .map(|binding| binding.name)
            .collect();
        assert_eq!(names, ["first", "mid", "mid2", "late"]);

        assert!(router.remove_binding("mid").await);
        assert!(!router.remove_binding("mid").await);
        assert_eq!(router.bindings().await.len(), 3);
    }

    #[tokio::test]
    async fn test_route_to_queue_bindings() {
        let broker = Broker::new(BrokerOptions::default());
        broker
            .create_queue("audit", QueueOptions::default())
            .await
            .unwrap();
        broker
            .create_queue("billing", QueueOptions::default())
            .await
            .unwrap();

        let router = Router::new("ingest");
        router
            .add_binding(Binding::to_queue("b1", "audit", 1))
            .await;
        router
            .add_binding(Binding::to_queue("b2", "billing", 2))
            .await;

        let result = router.route(&broker, message("event")).await;
        assert_eq!(result, PushResult::Ok);

        assert_eq!(broker.queue_info("audit").await.unwrap().stored, 1);
        assert_eq!(broker.queue_info("billing").await.unwrap().stored, 1);
    }

    #[tokio::test]
    async fn test_first_acquirer_stops_after_first_binding() {
        let broker = Broker::new(BrokerOptions::default());
        broker
            .create_queue("audit", QueueOptions::default())
            .await
            .unwrap();
        broker
            .create_queue("billing", QueueOptions::default())
            .await
            .unwrap();

        let router = Router::new("ingest");
        router
            .add_binding(Binding::to_queue("b1", "audit", 1))
            .await;
        router
            .add_binding(Binding::to_queue("b2", "billing", 2))
            .await;

        let mut exclusive = message("event");
        exclusive.first_acquirer_only = true;
        assert_eq!(router.route(&broker, exclusive).await, PushResult::Ok);

        assert_eq!(broker.queue_info("audit").await.unwrap().stored, 1);
        assert_eq!(broker.queue_info("billing").await.unwrap().stored, 0);
    }

    #[tokio::test]
    async fn test_ttl_exhaustion_drops() {
        let broker = Broker::new(BrokerOptions::default());
        let router = Router::new("ingest");
        router.add_binding(Binding::to_queue("b1", "audit", 1)).await;

        let mut dying = message("event");
        dying.ttl = 0;
        assert_eq!(
            router.route(&broker, dying).await,
            PushResult::Failed("ttl-exceeded".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_bindings_is_not_found() {
        let broker = Broker::new(BrokerOptions::default());
        let router = Router::new("ingest");
        assert_eq!(router.route(&broker, message("x")).await, PushResult::NotFound);
    }

    #[tokio::test]
    async fn test_deleted_queue_inside_cache_window_is_a_miss() {
        let broker = Broker::new(BrokerOptions::default());
        broker
            .create_queue("audit", QueueOptions::default())
            .await
            .unwrap();

        let router = Router::new("ingest");
        router
            .add_binding(
                Binding::to_queue("b1", "audit", 1)
                    .with_interaction(BindingInteraction::Acknowledge),
            )
            .await;

        // Warm the cache
        assert_eq!(router.route(&broker, message("one")).await, PushResult::Ok);

        // Delete and recreate the queue inside the 60 s window
        broker.remove_queue("audit").await.unwrap();
        broker
            .create_queue("audit", QueueOptions::default())
            .await
            .unwrap();

        // The stale handle is detected and re-resolved
        assert_eq!(router.route(&broker, message("two")).await, PushResult::Ok);
        assert_eq!(broker.queue_info("audit").await.unwrap().stored, 1);
    }

    #[tokio::test]
    async fn test_client_binding_first_receiver_only() {
        let broker = Broker::new(BrokerOptions::default());
        let (c1, mut rx1) = crate::registry::ClientHandle::channel("c1", "worker", "t");
        let (c2, mut rx2) = crate::registry::ClientHandle::channel("c2", "worker", "t");
        broker.registry().add(c1).await.unwrap();
        broker.registry().add(c2).await.unwrap();

        let router = Router::new("ingest");
        router
            .add_binding(Binding::to_clients("b1", "worker", 1).only_first_receiver())
            .await;

        assert_eq!(router.route(&broker, message("job")).await, PushResult::Ok);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }
}
