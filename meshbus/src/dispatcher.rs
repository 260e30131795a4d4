use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{message_handler, Connection};
use crate::driver::{ChannelId, ExchangeKind, PublishProperties};
use crate::error::{BusError, Result};
use crate::listener::ReplyListener;

/// An outstanding RPC call awaiting its reply
#[derive(Debug)]
struct PendingCall {
    response_tx: oneshot::Sender<Vec<u8>>,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, content: Vec<u8>, correlation_id: &str) {
        let call = self.lock().remove(correlation_id);
        match call {
            Some(call) => {
                debug!(
                    "Received reply for {} after {}ms",
                    correlation_id,
                    call.started_at.elapsed().as_millis()
                );
                if call.response_tx.send(content).is_err() {
                    warn!("Caller for {} is gone, discarding reply", correlation_id);
                }
            }
            None => debug!("No pending call for {}, ignoring reply", correlation_id),
        }
    }
}

/// Publishes requests on the bus exchange and correlates their replies.
///
/// Replies arrive on an anonymous queue owned by an internal [`ReplyListener`].
pub struct MessageDispatcher {
    connection: Arc<Connection>,
    reply_listener: ReplyListener,
    channel: tokio::sync::Mutex<Option<ChannelId>>,
    pending: Arc<PendingCalls>,
}

impl MessageDispatcher {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            reply_listener: ReplyListener::new(Arc::clone(&connection)),
            connection,
            channel: tokio::sync::Mutex::new(None),
            pending: Arc::new(PendingCalls::default()),
        }
    }

    /// Open the publishing channel and start the reply listener. Idempotent.
    pub async fn init(&self) -> Result<()> {
        let mut channel = self.channel.lock().await;
        if channel.is_some() {
            return Ok(());
        }

        let opened = self.connection.open_channel().await?;
        let pending = Arc::clone(&self.pending);
        let on_reply = message_handler(move |content, correlation_id| {
            pending.resolve(content, &correlation_id);
            async { Ok(None) }
        });

        let started = async {
            let bus = &self.connection.config().bus_exchange_name;
            self.connection
                .declare_exchange(opened, bus, ExchangeKind::Topic)
                .await?;
            self.reply_listener.init(Some(on_reply), None).await?;
            self.reply_listener.start().await
        };
        if let Err(e) = started.await {
            self.reply_listener.discard().await;
            if let Err(close_error) = self.connection.close_channel(opened).await {
                warn!("Failed to close {}: {}", opened, close_error);
            }
            return Err(e);
        }

        *channel = Some(opened);
        info!("Message dispatcher ready");
        Ok(())
    }

    /// Publish `content` on the bus exchange under `routing_key`.
    ///
    /// With `rpc` the returned future resolves with the reply bytes once a
    /// reply carrying the same correlation id arrives; there is no deadline.
    /// Without `rpc` it resolves to `None` as soon as the broker took the message.
    pub async fn publish(&self, content: &[u8], routing_key: &str, rpc: bool) -> Result<Option<Vec<u8>>> {
        match self.send(content, routing_key, rpc).await? {
            Some((correlation_id, reply)) => reply
                .await
                .map(Some)
                .map_err(|_| BusError::internal_error(format!("reply channel for {} closed", correlation_id))),
            None => Ok(None),
        }
    }

    /// Like an rpc [`publish`](Self::publish), but gives up after `timeout`
    pub async fn publish_with_timeout(&self, content: &[u8], routing_key: &str, timeout: Duration) -> Result<Vec<u8>> {
        let (correlation_id, reply) = self
            .send(content, routing_key, true)
            .await?
            .ok_or_else(|| BusError::internal_error("rpc publish produced no pending call"))?;

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(_)) => Err(BusError::internal_error(format!(
                "reply channel for {} closed",
                correlation_id
            ))),
            Err(_) => {
                self.pending.lock().remove(&correlation_id);
                Err(BusError::Timeout {
                    correlation_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn send(
        &self,
        content: &[u8],
        routing_key: &str,
        rpc: bool,
    ) -> Result<Option<(String, oneshot::Receiver<Vec<u8>>)>> {
        if !self.connection.is_connected() {
            return Err(BusError::NotConnected);
        }
        let channel = (*self.channel.lock().await).ok_or(BusError::NotInitialized)?;

        let correlation_id = Uuid::new_v4().to_string();
        let mut properties = PublishProperties::new(correlation_id.clone()).persistent();
        let mut reply = None;

        if rpc {
            let reply_queue = self
                .reply_listener
                .reply_queue()
                .await
                .ok_or(BusError::NotInitialized)?;
            properties = properties.with_reply_to(reply_queue);

            let (response_tx, response_rx) = oneshot::channel();
            self.pending.lock().insert(
                correlation_id.clone(),
                PendingCall {
                    response_tx,
                    started_at: Instant::now(),
                },
            );
            reply = Some(response_rx);
        }

        let exchange = &self.connection.config().bus_exchange_name;
        if let Err(e) = self
            .connection
            .publish(channel, exchange, routing_key, content, &properties)
            .await
        {
            self.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        debug!("Published {} to {} (rpc: {})", correlation_id, routing_key, rpc);
        Ok(reply.map(|reply| (correlation_id, reply)))
    }

    /// Resolve the pending call for `correlation_id`; unknown ids are ignored
    pub fn on_result(&self, content: Vec<u8>, correlation_id: &str) {
        self.pending.resolve(content, correlation_id);
    }

    /// Number of calls still waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop the reply listener and close the channel. Outstanding calls fail.
    ///
    /// The dispatcher is reset even when closing fails, so a later
    /// [`init`](Self::init) starts from scratch.
    pub async fn close(&self) -> Result<()> {
        let mut channel = self.channel.lock().await;

        let abandoned = {
            let mut calls = self.pending.lock();
            let count = calls.len();
            calls.clear();
            count
        };
        if abandoned > 0 {
            warn!("Closing dispatcher with {} calls still pending", abandoned);
        }

        let Some(opened) = channel.take() else {
            return Ok(());
        };
        let closed = async {
            self.reply_listener.close().await?;
            self.connection.close_channel(opened).await
        };
        if let Err(e) = closed.await {
            warn!("Dispatcher did not close cleanly: {}", e);
            self.reply_listener.discard().await;
            return Err(e);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}
