//! Serialize and deserialize protocol messages.
//!
//! Every message carries the correlation token, the sender [Contact] and one of
//! a request, a response or an error. The wire format is bencode.

mod internal;

use std::convert::TryInto;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use serde_bytes::ByteBuf;

use crate::common::{Contact, Id, ID_SIZE};
use crate::error::DecodeError;

/// KRPC "Server Error", used when the storage rejects a value.
pub const SERVER_ERROR_CODE: i32 = 202;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Correlation token, echoed back in responses.
    pub token: u32,

    /// The peer that authored this message.
    pub sender: Contact,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    /// Liveness probe.
    Ping,
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
    Store(StoreRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    /// Acknowledges a PING or a STORE.
    Ack,
    /// Closest contacts to the requested target.
    Nodes(NodesResponseArguments),
    /// A stored value, only in response to FIND_VALUE.
    Value(ValueResponseArguments),
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct NodesResponseArguments {
    pub contacts: Vec<Contact>,
}

// === FIND_VALUE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequestArguments {
    pub key: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ValueResponseArguments {
    pub value: Bytes,
}

// === STORE ===

#[derive(Debug, PartialEq, Clone)]
pub struct StoreRequestArguments {
    pub key: Id,
    pub value: Bytes,
}

impl RequestSpecific {
    /// Method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            RequestSpecific::Ping => "ping",
            RequestSpecific::FindNode(_) => "find_node",
            RequestSpecific::FindValue(_) => "find_value",
            RequestSpecific::Store(_) => "store",
        }
    }
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            token: ByteBuf::from(self.token.to_be_bytes().to_vec()),
            id: ByteBuf::from(self.sender.id().to_vec()),
            address: ByteBuf::from(sockaddr_to_bytes(&self.sender.address())),
            variant: match self.message_type {
                MessageType::Request(request) => internal::DHTMessageVariant::Request(match request
                {
                    RequestSpecific::Ping => internal::DHTRequestSpecific::Ping {
                        arguments: internal::DHTPingRequestArguments::default(),
                    },
                    RequestSpecific::FindNode(FindNodeRequestArguments { target }) => {
                        internal::DHTRequestSpecific::FindNode {
                            arguments: internal::DHTFindNodeRequestArguments {
                                target: ByteBuf::from(target.to_vec()),
                            },
                        }
                    }
                    RequestSpecific::FindValue(FindValueRequestArguments { key }) => {
                        internal::DHTRequestSpecific::FindValue {
                            arguments: internal::DHTFindValueRequestArguments {
                                key: ByteBuf::from(key.to_vec()),
                            },
                        }
                    }
                    RequestSpecific::Store(StoreRequestArguments { key, value }) => {
                        internal::DHTRequestSpecific::Store {
                            arguments: internal::DHTStoreRequestArguments {
                                key: ByteBuf::from(key.to_vec()),
                                v: ByteBuf::from(value.to_vec()),
                            },
                        }
                    }
                }),

                MessageType::Response(response) => {
                    internal::DHTMessageVariant::Response(internal::DHTResponseSpecific {
                        arguments: match response {
                            ResponseSpecific::Ack => internal::DHTResponseArguments::default(),
                            ResponseSpecific::Nodes(NodesResponseArguments { contacts }) => {
                                internal::DHTResponseArguments {
                                    nodes: Some(contacts_to_bytes(&contacts)),
                                    v: None,
                                }
                            }
                            ResponseSpecific::Value(ValueResponseArguments { value }) => {
                                internal::DHTResponseArguments {
                                    nodes: None,
                                    v: Some(ByteBuf::from(value.to_vec())),
                                }
                            }
                        },
                    })
                }

                MessageType::Error(err) => {
                    internal::DHTMessageVariant::Error(internal::DHTErrorSpecific {
                        error_info: (err.code, err.description),
                    })
                }
            },
        }
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message, DecodeError> {
        Ok(Message {
            token: token(&msg.token)?,
            sender: Contact::new(Id::from_bytes(&msg.id)?, bytes_to_sockaddr(&msg.address)?),
            message_type: match msg.variant {
                internal::DHTMessageVariant::Request(request) => {
                    MessageType::Request(match request {
                        internal::DHTRequestSpecific::Ping { .. } => RequestSpecific::Ping,
                        internal::DHTRequestSpecific::FindNode { arguments } => {
                            RequestSpecific::FindNode(FindNodeRequestArguments {
                                target: Id::from_bytes(&arguments.target)?,
                            })
                        }
                        internal::DHTRequestSpecific::FindValue { arguments } => {
                            RequestSpecific::FindValue(FindValueRequestArguments {
                                key: Id::from_bytes(&arguments.key)?,
                            })
                        }
                        internal::DHTRequestSpecific::Store { arguments } => {
                            RequestSpecific::Store(StoreRequestArguments {
                                key: Id::from_bytes(&arguments.key)?,
                                value: Bytes::from(arguments.v.into_vec()),
                            })
                        }
                    })
                }

                internal::DHTMessageVariant::Response(response) => {
                    let arguments = response.arguments;

                    // A value takes precedence over closer nodes.
                    MessageType::Response(match (arguments.v, arguments.nodes) {
                        (Some(v), _) => ResponseSpecific::Value(ValueResponseArguments {
                            value: Bytes::from(v.into_vec()),
                        }),
                        (None, Some(nodes)) => ResponseSpecific::Nodes(NodesResponseArguments {
                            contacts: bytes_to_contacts(&nodes)?,
                        }),
                        (None, None) => ResponseSpecific::Ack,
                    })
                }

                internal::DHTMessageVariant::Error(err) => MessageType::Error(ErrorSpecific {
                    code: err.error_info.0,
                    description: err.error_info.1,
                }),
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, DecodeError> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }

    /// If the response contains closer contacts to the target, return them.
    pub fn get_closer_contacts(&self) -> Option<&[Contact]> {
        match &self.message_type {
            MessageType::Response(ResponseSpecific::Nodes(arguments)) => {
                Some(&arguments.contacts)
            }
            _ => None,
        }
    }
}

/// Return the token as a u32
pub fn token(bytes: &[u8]) -> Result<u32, DecodeError> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| DecodeError::InvalidToken(bytes.to_vec()))?;

    Ok(u32::from_be_bytes(array))
}

fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddr, DecodeError> {
    let bytes = bytes.as_ref();
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);

            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let octets: [u8; 16] = bytes[..16]
                .try_into()
                .map_err(|_| DecodeError::InvalidAddress(bytes.len()))?;
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);

            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(DecodeError::InvalidAddress(bytes.len())),
    }
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(18);

    match sockaddr {
        SocketAddr::V4(v4) => bytes.extend_from_slice(&v4.ip().octets()),
        SocketAddr::V6(v6) => bytes.extend_from_slice(&v6.ip().octets()),
    }

    bytes.extend_from_slice(&sockaddr.port().to_be_bytes());

    bytes
}

fn contacts_to_bytes(contacts: &[Contact]) -> Vec<ByteBuf> {
    contacts
        .iter()
        .map(|contact| {
            let mut bytes = contact.id().to_vec();
            bytes.append(&mut sockaddr_to_bytes(&contact.address()));

            ByteBuf::from(bytes)
        })
        .collect()
}

fn bytes_to_contacts(list: &[ByteBuf]) -> Result<Vec<Contact>, DecodeError> {
    list.iter()
        .map(|bytes| {
            if bytes.len() < ID_SIZE {
                return Err(DecodeError::InvalidIdSize(bytes.len()));
            }

            let id = Id::from_bytes(&bytes[..ID_SIZE])?;
            let address = bytes_to_sockaddr(&bytes[ID_SIZE..])?;

            Ok(Contact::new(id, address))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn sender() -> Contact {
        Contact::from_str("da23614e00469a0d7c7bd1bdab5c9c474b1904dc@127.0.0.1:6881").unwrap()
    }

    #[test]
    fn test_token() {
        assert_eq!(token(&[0, 0, 1, 2]).unwrap(), 258);
        assert!(token(&[1, 2]).is_err());
        assert!(token(&[]).is_err());
    }

    #[test]
    fn test_ping_request_bytes() {
        let message = Message {
            token: 258,
            sender: sender(),
            message_type: MessageType::Request(RequestSpecific::Ping),
        };

        let bytes = message.to_bytes().unwrap();

        assert_eq!(
            bytes,
            b"d1:ade4:addr6:\x7f\x00\x00\x01\x1a\xe12:id20:\xda\x23\x61\x4e\x00\x46\x9a\x0d\x7c\x7b\xd1\xbd\xab\x5c\x9c\x47\x4b\x19\x04\xdc1:q4:ping1:t4:\x00\x00\x01\x021:y1:qe"
        );
        assert_eq!(Message::from_bytes(bytes).unwrap(), message);
    }

    #[test]
    fn test_find_value_responses() {
        let value = Message {
            token: 7,
            sender: sender(),
            message_type: MessageType::Response(ResponseSpecific::Value(ValueResponseArguments {
                value: Bytes::from_static(b"hello"),
            })),
        };

        let parsed = Message::from_bytes(value.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, value);
        assert!(parsed.get_closer_contacts().is_none());

        let contacts = vec![
            Contact::new(Id::random(), "10.0.0.1:1000".parse().unwrap()),
            Contact::new(Id::random(), "[::1]:2000".parse().unwrap()),
        ];

        let nodes = Message {
            token: 8,
            sender: sender(),
            message_type: MessageType::Response(ResponseSpecific::Nodes(NodesResponseArguments {
                contacts: contacts.clone(),
            })),
        };

        let parsed = Message::from_bytes(nodes.to_bytes().unwrap()).unwrap();
        let closer = parsed.get_closer_contacts().unwrap();

        assert_eq!(closer, &contacts[..]);
        assert_eq!(closer[1].address(), contacts[1].address());
    }

    #[test]
    fn test_ack_and_error() {
        for message_type in [
            MessageType::Response(ResponseSpecific::Ack),
            MessageType::Error(ErrorSpecific {
                code: SERVER_ERROR_CODE,
                description: "Value too large".to_string(),
            }),
        ] {
            let message = Message {
                token: u32::MAX,
                sender: sender(),
                message_type,
            };

            assert_eq!(
                Message::from_bytes(message.to_bytes().unwrap()).unwrap(),
                message
            );
        }
    }

    #[test]
    fn test_malformed() {
        assert!(Message::from_bytes(b"not bencode").is_err());
        // Valid bencode, unknown method.
        assert!(Message::from_bytes(
            b"d1:ade4:addr6:\x7f\x00\x00\x01\x1a\xe12:id20:\xda\x23\x61\x4e\x00\x46\x9a\x0d\x7c\x7b\xd1\xbd\xab\x5c\x9c\x47\x4b\x19\x04\xdc1:q5:frobs1:t4:\x00\x00\x01\x021:y1:qe"
        )
        .is_err());
        // Short sender id.
        assert!(Message::from_bytes(
            b"d1:ade4:addr6:\x7f\x00\x00\x01\x1a\xe12:id2:ab1:q4:ping1:t4:\x00\x00\x01\x021:y1:qe"
        )
        .is_err());
    }
}
