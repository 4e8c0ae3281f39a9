use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use portwatch_core::{BusMessage, StreamId};

use crate::queue::DropOldestQueue;

/// Publishes a worker's detection-channel traffic somewhere external to the
/// worker itself. Publish failures are logged and swallowed — a struggling
/// transport must never stall a worker's inference loop.
#[async_trait]
pub trait EventBusAdapter: Send + Sync {
    async fn publish(&self, stream_id: &str, message: &BusMessage);

    /// Registers a queue that should also receive every message published
    /// for `stream_id`, used to back the `detection_out` queue surfaced by
    /// `Orchestrator::get_stream`/API polling without requiring the caller
    /// to hold a broadcast receiver open.
    fn register_local_sink(&self, stream_id: &str, sink: std::sync::Arc<DropOldestQueue<BusMessage>>);

    fn unregister_local_sink(&self, stream_id: &str);
}

/// In-process fan-out over a `tokio::sync::broadcast` channel per stream,
/// grounded on `InProcJobEventBus`. No wire format involved; subscribers
/// receive `BusMessage` values directly.
pub struct InProcEventBus {
    channel_capacity: usize,
    channels: Mutex<HashMap<StreamId, broadcast::Sender<BusMessage>>>,
    sinks: Mutex<HashMap<StreamId, Vec<std::sync::Arc<DropOldestQueue<BusMessage>>>>>,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("channel_capacity", &self.channel_capacity)
            .field("active_streams", &self.channels.lock().len())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            channel_capacity,
            channels: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, stream_id: &str) -> broadcast::Receiver<BusMessage> {
        let mut channels = self.channels.lock();
        channels
            .entry(stream_id.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }
}

#[async_trait]
impl EventBusAdapter for InProcEventBus {
    async fn publish(&self, stream_id: &str, message: &BusMessage) {
        let sender = {
            let mut channels = self.channels.lock();
            channels
                .entry(stream_id.to_string())
                .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
                .clone()
        };
        let _ = sender.send(message.clone());

        if let Some(sinks) = self.sinks.lock().get(stream_id) {
            for sink in sinks {
                sink.put(message.clone());
            }
        }
    }

    fn register_local_sink(&self, stream_id: &str, sink: std::sync::Arc<DropOldestQueue<BusMessage>>) {
        self.sinks
            .lock()
            .entry(stream_id.to_string())
            .or_default()
            .push(sink);
    }

    fn unregister_local_sink(&self, stream_id: &str) {
        self.sinks.lock().remove(stream_id);
        self.channels.lock().remove(stream_id);
    }
}

/// Publishes to Redis channel `detections:{stream_id}` via `PUBLISH`,
/// grounded on `RedisCache`'s `ConnectionManager` connection pattern. Local
/// sinks are still served in-process so the API can poll `detection_out`
/// without a Redis round trip.
pub struct RedisEventBus {
    conn: Mutex<ConnectionManager>,
    sinks: Mutex<HashMap<StreamId, Vec<std::sync::Arc<DropOldestQueue<BusMessage>>>>>,
}

impl RedisEventBus {
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn: Mutex::new(conn),
            sinks: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl EventBusAdapter for RedisEventBus {
    async fn publish(&self, stream_id: &str, message: &BusMessage) {
        if let Some(sinks) = self.sinks.lock().get(stream_id) {
            for sink in sinks {
                sink.put(message.clone());
            }
        }

        let Some(json) = message.to_json() else {
            return;
        };
        let channel = format!("detections:{stream_id}");
        let mut conn = self.conn.lock().clone();
        debug!(stream_id, channel, "publishing detection event");
        if let Err(error) = conn.publish::<_, _, ()>(&channel, json).await {
            warn!(stream_id, %error, "redis publish failed, dropping event");
        }
    }

    fn register_local_sink(&self, stream_id: &str, sink: std::sync::Arc<DropOldestQueue<BusMessage>>) {
        self.sinks
            .lock()
            .entry(stream_id.to_string())
            .or_default()
            .push(sink);
    }

    fn unregister_local_sink(&self, stream_id: &str) {
        self.sinks.lock().remove(stream_id);
    }
}
