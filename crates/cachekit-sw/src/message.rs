//! Page ↔ worker messaging.
//!
//! Messages are JSON objects `{ "type": ..., "data": ... }`. Replies travel
//! over a [`MessagePort`] transferred with the message.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::ServiceWorkerError;

// ==================== Message Ports ====================

/// Unique identifier for message ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u64);

impl PortId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// One end of a message channel.
#[derive(Debug)]
pub struct MessagePort {
    pub id: PortId,
    tx: mpsc::UnboundedSender<JsonValue>,
    rx: mpsc::UnboundedReceiver<JsonValue>,
}

impl MessagePort {
    /// Create an entangled pair: what one end posts, the other receives.
    pub fn create_pair() -> (MessagePort, MessagePort) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        let port1 = MessagePort {
            id: PortId::new(),
            tx: tx2,
            rx: rx1,
        };
        let port2 = MessagePort {
            id: PortId::new(),
            tx: tx1,
            rx: rx2,
        };
        (port1, port2)
    }

    /// Post a message to the other end.
    pub fn post_message(&self, data: JsonValue) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(data)
            .map_err(|_| ServiceWorkerError::PortClosed(self.id.raw()))
    }

    /// Receive the next message, or `None` once the other end is gone.
    pub async fn recv(&mut self) -> Option<JsonValue> {
        self.rx.recv().await
    }
}

/// A message delivered to a worker, with any transferred ports.
#[derive(Debug)]
pub struct WorkerMessage {
    pub data: JsonValue,
    pub ports: Vec<MessagePort>,
}

impl WorkerMessage {
    pub fn new(data: JsonValue) -> Self {
        Self {
            data,
            ports: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: MessagePort) -> Self {
        self.ports.push(port);
        self
    }
}

// ==================== Control Protocol ====================

/// Control messages understood by the cache router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    ClearCache,
    UpdateCache { paths: Vec<String> },
    GetCacheInfo,
    SkipWaiting,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<JsonValue>,
}

#[derive(Deserialize)]
struct UpdateCacheData {
    #[serde(default)]
    paths: Option<Vec<String>>,
}

/// Why a message could not be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unrecognized {
    /// No string `type` field.
    Malformed,
    /// A `type` nobody handles.
    UnknownType(String),
}

impl ControlMessage {
    pub const CLEAR_CACHE: &'static str = "CLEAR_CACHE";
    pub const UPDATE_CACHE: &'static str = "UPDATE_CACHE";
    pub const GET_CACHE_INFO: &'static str = "GET_CACHE_INFO";
    pub const SKIP_WAITING: &'static str = "SKIP_WAITING";

    /// Parse a posted message.
    pub fn parse(value: &JsonValue) -> Result<Self, Unrecognized> {
        let raw: RawMessage =
            serde_json::from_value(value.clone()).map_err(|_| Unrecognized::Malformed)?;
        let kind = raw.kind.ok_or(Unrecognized::Malformed)?;

        match kind.as_str() {
            Self::CLEAR_CACHE => Ok(ControlMessage::ClearCache),
            Self::GET_CACHE_INFO => Ok(ControlMessage::GetCacheInfo),
            Self::SKIP_WAITING => Ok(ControlMessage::SkipWaiting),
            Self::UPDATE_CACHE => {
                let paths = raw
                    .data
                    .and_then(|d| serde_json::from_value::<UpdateCacheData>(d).ok())
                    .and_then(|d| d.paths)
                    .unwrap_or_else(|| vec!["/".to_string()]);
                Ok(ControlMessage::UpdateCache { paths })
            }
            _ => Err(Unrecognized::UnknownType(kind)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::ClearCache => Self::CLEAR_CACHE,
            ControlMessage::UpdateCache { .. } => Self::UPDATE_CACHE,
            ControlMessage::GetCacheInfo => Self::GET_CACHE_INFO,
            ControlMessage::SkipWaiting => Self::SKIP_WAITING,
        }
    }

    /// Wire form.
    pub fn to_json(&self) -> JsonValue {
        match self {
            ControlMessage::UpdateCache { paths } => {
                json!({ "type": self.kind(), "data": { "paths": paths } })
            }
            _ => json!({ "type": self.kind() }),
        }
    }
}

/// One partition in a [`CacheInfo`] reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub name: String,
    pub entries: usize,
}

/// Reply to `GET_CACHE_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub version: String,
    pub caches: Vec<PartitionInfo>,
    pub total_size: usize,
}

impl CacheInfo {
    pub fn total_entries(&self) -> usize {
        self.caches.iter().map(|c| c.entries).sum()
    }
}
