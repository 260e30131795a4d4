//! In-process broker with AMQP routing, prefetch and acknowledgement semantics.
//!
//! Used as the reference driver in tests and for single-process deployments.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    BrokerDriver, ChannelId, ConsumeOptions, Delivery, DeliveryStream, ExchangeKind, ExchangeOptions,
    PublishProperties, QueueOptions,
};
use crate::error::{BusError, Result};
use crate::trie::TopicRouter;

const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    persistent: bool,
    redelivered: bool,
    data: Vec<u8>,
}

/// Per-exchange publish counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub total: usize,
    pub transient: usize,
}

struct ConsumerEntry {
    tag: String,
    channel: ChannelId,
    no_ack: bool,
    exclusive: bool,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct QueueEntry {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    consumers: VecDeque<ConsumerEntry>,
    had_consumer: bool,
}

impl QueueEntry {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            consumers: VecDeque::new(),
            had_consumer: false,
        }
    }
}

#[derive(Default)]
struct Binding {
    keys: BTreeSet<String>,
    router: TopicRouter<()>,
}

impl Binding {
    fn add(&mut self, key: &str) {
        if self.keys.insert(key.to_string()) {
            self.router.add(key, ());
        }
    }

    fn remove(&mut self, key: &str) {
        if self.keys.remove(key) {
            let mut router = TopicRouter::new();
            for key in &self.keys {
                router.add(key, ());
            }
            self.router = router;
        }
    }

    fn matches(&self, kind: ExchangeKind, routing_key: &str) -> bool {
        match kind {
            ExchangeKind::Direct => self.keys.contains(routing_key),
            ExchangeKind::Topic => !self.router.match_topic(routing_key).is_empty(),
        }
    }
}

struct ExchangeEntry {
    kind: ExchangeKind,
    bindings: HashMap<String, Binding>,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct ChannelEntry {
    prefetch: u16,
    unacked: HashMap<u64, Unacked>,
}

impl ChannelEntry {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }
}

#[derive(Default)]
struct BrokerState {
    connected: bool,
    next_channel: u64,
    next_delivery_tag: u64,
    channels: HashMap<ChannelId, ChannelEntry>,
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    published: HashMap<String, PublishStats>,
}

impl BrokerState {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }

    fn ensure_channel(&self, channel: ChannelId) -> Result<()> {
        self.ensure_connected()?;
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(BusError::broker_error(format!("unknown {}", channel)))
        }
    }

    fn queue_mut(&mut self, queue: &str) -> Result<&mut QueueEntry> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| BusError::broker_error(format!("no queue '{}'", queue)))
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let entry = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::broker_error(format!("no exchange '{}'", exchange)))?;

        Ok(entry
            .bindings
            .iter()
            .filter(|(_, binding)| binding.matches(entry.kind, routing_key))
            .map(|(queue, _)| queue.clone())
            .collect())
    }

    /// Hand ready messages to consumers whose channel still has prefetch capacity
    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            queues,
            channels,
            next_delivery_tag,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let Some(position) = queue.consumers.iter().position(|consumer| {
                consumer.no_ack
                    || channels
                        .get(&consumer.channel)
                        .map(ChannelEntry::has_capacity)
                        .unwrap_or(false)
            }) else {
                break;
            };
            let Some(consumer) = queue.consumers.remove(position) else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                queue.consumers.push_front(consumer);
                break;
            };

            *next_delivery_tag += 1;
            let delivery_tag = *next_delivery_tag;
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                correlation_id: message.correlation_id.clone(),
                reply_to: message.reply_to.clone(),
                persistent: message.persistent,
                redelivered: message.redelivered,
                data: message.data.clone(),
            };

            if consumer.sender.send(Ok(delivery)).is_err() {
                debug!("Consumer {} went away, dropping it", consumer.tag);
                queue.ready.push_front(message);
                continue;
            }

            if !consumer.no_ack {
                if let Some(channel) = channels.get_mut(&consumer.channel) {
                    channel.unacked.insert(
                        delivery_tag,
                        Unacked {
                            queue: queue_name.to_string(),
                            message,
                        },
                    );
                }
            }
            // round robin
            queue.consumers.push_back(consumer);
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn delete_queue(&mut self, queue: &str) -> Option<QueueEntry> {
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.remove(queue);
        }
        self.queues.remove(queue)
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }

    fn release_channel(&mut self, channel: ChannelId) {
        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| consumer.channel != channel);
            if before > 0 && queue.consumers.is_empty() && queue.options.auto_delete {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            debug!("Auto-deleting queue {}", name);
            self.delete_queue(&name);
        }

        if let Some(entry) = self.channels.remove(&channel) {
            let mut unacked: Vec<(u64, Unacked)> = entry.unacked.into_iter().collect();
            unacked.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, message) in unacked {
                self.requeue(message);
            }
        }
    }
}

/// Broker living in the current process. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages waiting in a queue, not yet delivered
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Messages accepted by `exchange` so far, and how many of them were not persistent
    pub fn publish_stats(&self, exchange: &str) -> PublishStats {
        self.lock().published.get(exchange).copied().unwrap_or_default()
    }

    /// Delivered but unacknowledged messages across every channel
    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.consumers.len()).unwrap_or(0)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.lock().queues.get(queue).map(|q| q.options)
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(exchange).map(|e| e.kind)
    }

    /// Binding keys of `queue` on `exchange`, sorted
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.lock()
            .exchanges
            .get(exchange)
            .and_then(|e| e.bindings.get(queue))
            .map(|b| b.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBroker")
            .field("connected", &state.connected)
            .field("channels", &state.channels.len())
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .finish()
    }
}

#[async_trait]
impl BrokerDriver for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<()> {
        debug!("Memory broker accepting connection for {}", url);
        self.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.lock();
        let channels: Vec<ChannelId> = state.channels.keys().copied().collect();
        for channel in channels {
            state.release_channel(channel);
        }
        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.options.exclusive)
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            state.delete_queue(&name);
        }
        state.connected = false;
        Ok(())
    }

    async fn open_channel(&self) -> Result<ChannelId> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.next_channel += 1;
        let id = ChannelId(state.next_channel);
        state.channels.insert(id, ChannelEntry::default());
        Ok(id)
    }

    async fn close_channel(&self, channel: ChannelId) -> Result<()> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        state.release_channel(channel);
        state.dispatch_all();
        Ok(())
    }

    async fn declare_exchange(
        &self,
        channel: ChannelId,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeOptions,
    ) -> Result<()> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BusError::broker_error(format!(
                "exchange '{}' already declared as {}",
                name,
                existing.kind.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeEntry {
                        kind,
                        bindings: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, channel: ChannelId, name: Option<&str>, options: QueueOptions) -> Result<String> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        let name = match name.filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("amq.gen-{}", uuid::Uuid::new_v4()),
        };
        state
            .queues
            .entry(name.clone())
            .or_insert_with(|| QueueEntry::new(options));
        Ok(name)
    }

    async fn bind_queue(&self, channel: ChannelId, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        state.queue_mut(queue)?;
        let entry = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::broker_error(format!("no exchange '{}'", exchange)))?;
        entry.bindings.entry(queue.to_string()).or_default().add(routing_key);
        Ok(())
    }

    async fn unbind_queue(&self, channel: ChannelId, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        if let Some(binding) = state
            .exchanges
            .get_mut(exchange)
            .and_then(|e| e.bindings.get_mut(queue))
        {
            binding.remove(routing_key);
        }
        Ok(())
    }

    async fn delete_queue(&self, channel: ChannelId, queue: &str) -> Result<()> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        state.delete_queue(queue);
        Ok(())
    }

    async fn purge_queue(&self, channel: ChannelId, queue: &str) -> Result<u32> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        let entry = state.queue_mut(queue)?;
        let purged = entry.ready.len() as u32;
        entry.ready.clear();
        Ok(purged)
    }

    async fn prefetch(&self, channel: ChannelId, count: u16) -> Result<()> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        if let Some(entry) = state.channels.get_mut(&channel) {
            entry.prefetch = count;
        }
        state.dispatch_all();
        Ok(())
    }

    async fn consume(&self, channel: ChannelId, queue: &str, options: &ConsumeOptions) -> Result<DeliveryStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            state.ensure_channel(channel)?;
            let entry = state.queue_mut(queue)?;
            if entry.consumers.iter().any(|c| c.exclusive) || (options.exclusive && !entry.consumers.is_empty()) {
                return Err(BusError::broker_error(format!("queue '{}' is consumed exclusively", queue)));
            }
            entry.consumers.push_back(ConsumerEntry {
                tag: options.consumer_tag.clone(),
                channel,
                no_ack: options.no_ack,
                exclusive: options.exclusive,
                sender,
            });
            entry.had_consumer = true;
            state.dispatch(queue);
        }

        Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, channel: ChannelId, consumer_tag: &str) -> Result<()> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        let mut emptied = None;
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.tag != consumer_tag);
            if queue.consumers.len() < before {
                if queue.consumers.is_empty() && queue.options.auto_delete && queue.had_consumer {
                    emptied = Some(name.clone());
                }
                break;
            }
        }
        if let Some(name) = emptied {
            debug!("Auto-deleting queue {}", name);
            state.delete_queue(&name);
        }
        Ok(())
    }

    async fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        let targets = state.route(exchange, routing_key)?;
        let stats = state.published.entry(exchange.to_string()).or_default();
        stats.total += 1;
        if !properties.persistent {
            stats.transient += 1;
        }
        if targets.is_empty() {
            debug!("Unroutable message on {} with key {}", exchange, routing_key);
        }

        for target in targets {
            let message = StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                correlation_id: properties.correlation_id.clone(),
                reply_to: properties.reply_to.clone(),
                persistent: properties.persistent,
                redelivered: false,
                data: payload.to_vec(),
            };
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(message);
            }
            state.dispatch(&target);
        }
        Ok(())
    }

    async fn ack(&self, channel: ChannelId, delivery_tag: u64) -> Result<()> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        let unacked = state
            .channels
            .get_mut(&channel)
            .and_then(|c| c.unacked.remove(&delivery_tag))
            .ok_or_else(|| BusError::broker_error(format!("unknown delivery tag {}", delivery_tag)))?;
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn reject(&self, channel: ChannelId, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.lock();
        state.ensure_channel(channel)?;
        let unacked = state
            .channels
            .get_mut(&channel)
            .and_then(|c| c.unacked.remove(&delivery_tag))
            .ok_or_else(|| BusError::broker_error(format!("unknown delivery tag {}", delivery_tag)))?;
        let queue = unacked.queue.clone();
        if requeue {
            state.requeue(unacked);
        }
        state.dispatch(&queue);
        Ok(())
    }
}
