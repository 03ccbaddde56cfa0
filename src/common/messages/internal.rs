use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTMessage {
    #[serde(rename = "t")]
    pub token: ByteBuf,

    /// Sender Id.
    #[serde(rename = "id")]
    pub id: ByteBuf,

    /// Sender compact address.
    #[serde(rename = "addr")]
    pub address: ByteBuf,

    #[serde(flatten)]
    pub variant: DHTMessageVariant,
}

impl DHTMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum DHTMessageVariant {
    #[serde(rename = "q")]
    Request(DHTRequestSpecific),

    #[serde(rename = "r")]
    Response(DHTResponseSpecific),

    #[serde(rename = "e")]
    Error(DHTErrorSpecific),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum DHTRequestSpecific {
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "a")]
        arguments: DHTPingRequestArguments,
    },

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "a")]
        arguments: DHTFindNodeRequestArguments,
    },

    #[serde(rename = "find_value")]
    FindValue {
        #[serde(rename = "a")]
        arguments: DHTFindValueRequestArguments,
    },

    #[serde(rename = "store")]
    Store {
        #[serde(rename = "a")]
        arguments: DHTStoreRequestArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTResponseSpecific {
    #[serde(rename = "r")]
    pub arguments: DHTResponseArguments,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTErrorSpecific {
    #[serde(rename = "e")]
    pub error_info: (i32, String),
}

// === PING ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTPingRequestArguments {}

// === FIND NODE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindNodeRequestArguments {
    pub target: ByteBuf,
}

// === FIND VALUE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindValueRequestArguments {
    pub key: ByteBuf,
}

// === STORE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTStoreRequestArguments {
    pub key: ByteBuf,

    pub v: ByteBuf,
}

// === Responses ===

/// Every response shares this shape:
/// - `nodes` for FIND_NODE and FIND_VALUE misses.
/// - `v` for FIND_VALUE hits.
/// - Neither, for PING and STORE acknowledgments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTResponseArguments {
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<ByteBuf>>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<ByteBuf>,
}
