use crate::cluster::identity::NodeIdentity;
use crate::cluster::partition::PartitionNumber;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

const KNOWN_ACTIONS: &[&str] = &[
    "claim_vnode",
    "recover_vnode",
    "release_vnodes",
    "update_vnode_table",
    "vnode_table_publish",
    "status",
    "set_log_level",
];

/// One command on a control channel. On the wire it's a JSON object whose `action` key selects
/// the variant, e.g. `{"action":"claim_vnode","vnode_id":12}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlMessage {
    ClaimVnode {
        vnode_id: PartitionNumber,
    },
    RecoverVnode {
        vnode_id: PartitionNumber,
    },
    ReleaseVnodes,
    UpdateVnodeTable {
        data: NodeAnnouncement,
    },
    VnodeTablePublish,
    Status {
        rsvp: String,
    },
    SetLogLevel {
        level: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rsvp: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ControlMessageDecodeError {
    #[error("not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("no 'action' key")]
    MissingAction,
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("malformed '{action}' message: {source}")]
    Malformed {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ControlMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, ControlMessageDecodeError> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(ControlMessageDecodeError::InvalidJson)?;

        let action = match value.get("action").and_then(|a| a.as_str()) {
            Some(action) => action.to_string(),
            None => return Err(ControlMessageDecodeError::MissingAction),
        };
        if !KNOWN_ACTIONS.contains(&action.as_str()) {
            return Err(ControlMessageDecodeError::UnknownAction(action));
        }

        serde_json::from_value(value).map_err(|source| ControlMessageDecodeError::Malformed { action, source })
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TableAction {
    Add,
    Update,
    Remove,
}

impl TableAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableAction::Add => "add",
            TableAction::Update => "update",
            TableAction::Remove => "remove",
        }
    }

    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "add" => Some(TableAction::Add),
            "update" => Some(TableAction::Update),
            "remove" => Some(TableAction::Remove),
            _ => None,
        }
    }
}

/// What a node says about itself: who it is and which partitions it holds. Carries an `update`
/// action when it's meant for ownership tables, and none when it's a status reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    #[serde(flatten)]
    pub node: NodeIdentity,
    #[serde(default)]
    pub vnodes: Vec<PartitionNumber>,
    #[serde(default, alias = "action", skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
}

impl NodeAnnouncement {
    pub fn new(node: NodeIdentity, vnodes: Vec<PartitionNumber>, update: Option<TableAction>) -> Self {
        NodeAnnouncement {
            node,
            vnodes,
            update: update.map(|action| action.as_str().to_string()),
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Reply to `set_log_level`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLevelReply {
    pub level: String,
    pub node: NodeIdentity,
}

impl LogLevelReply {
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}
