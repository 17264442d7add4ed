//! Typed messages carried inside envelopes. Payloads are UTF-8 JSON; the
//! envelope's content-type tag carries the `Message::TYPE` name so readers
//! can reject payloads of the wrong kind before parsing.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;

pub trait Message: Serialize + DeserializeOwned {
    /// Content-type tag written into the envelope.
    const TYPE: &'static str;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| Error::MessageParse(err.to_string()))
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|err| Error::MessageParse(err.to_string()))
    }
}

/// Machine identity of a node: the `(host, process, thread)` triple used to
/// reject double-announces from the same thread.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub host_id: String,
    pub process_id: u32,
    pub thread_id: String,
}

impl NodeId {
    /// The reserved identity whose heartbeat triggers the resolver sweep.
    pub fn sentinel() -> NodeId {
        NodeId {
            host_id: "self".to_string(),
            process_id: 0,
            thread_id: "self".to_string(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.host_id == "self" && self.process_id == 0 && self.thread_id == "self"
    }

    /// Registry key string.
    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.host_id, self.process_id, self.thread_id)
    }
}

/// Requests understood by the resolver's `resolv` service. Serialization is
/// externally tagged, so exactly one field names the operation:
/// `{"announce_node": {...}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    AnnounceNode {
        node_id: NodeId,
        node_name: String,
    },
    ShutdownNode {
        node_name: String,
    },
    AnnounceService {
        node_name: String,
        service_name: String,
        sock_addr: String,
    },
    ResolveService {
        service_name: String,
    },
    Heartbeat {
        node_id: NodeId,
    },
    NodeTopic {
        node_name: String,
        topic_name: String,
        reverse: bool,
        active: bool,
    },
    NodeService {
        node_name: String,
        service_name: String,
        reverse: bool,
        active: bool,
    },
    GetGraph {},
}

impl Message for Request {
    const TYPE: &'static str = "axon.Request";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    AnnounceNode {
        ok: bool,
        node_name: String,
        xsub_sock_addr: String,
        xpub_sock_addr: String,
    },
    ShutdownNode {
        ok: bool,
    },
    AnnounceService {
        ok: bool,
    },
    ResolveService {
        ok: bool,
        sock_addr: String,
    },
    Heartbeat {
        ok: bool,
        time_usec: i64,
    },
    NodeTopic {},
    NodeService {},
    GetGraph {
        graph: Graph,
    },
}

impl Message for Response {
    const TYPE: &'static str = "axon.Response";
}

/// One directed edge of the network graph. `reversed = false` means the
/// node publishes the topic / offers the service; `reversed = true` means
/// it subscribes / uses.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GraphLink {
    pub node_name: String,
    pub other_name: String,
    pub reversed: bool,
}

/// Snapshot of the active network: node names plus node-topic and
/// node-service links.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Graph {
    pub nodes: Vec<String>,
    pub node_topic: Vec<GraphLink>,
    pub node_service: Vec<GraphLink>,
}

impl Message for Graph {
    const TYPE: &'static str = "axon.Graph";
}

/// One line of the aggregated `log` topic stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub node_name: String,
    pub level: String,
    pub message: String,
    pub time_usec: i64,
}

impl Message for LogEntry {
    const TYPE: &'static str = "axon.LogEntry";
}
