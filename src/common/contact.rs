//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    net::{SocketAddr, SocketAddrV4},
    str::FromStr,
};

use crate::common::Id;
use crate::error::DecodeError;

#[derive(Debug, Clone, Copy)]
/// A peer in the overlay: its [Id] and where a transport can reach it.
///
/// Two contacts are the same peer if their ids match, the address is only
/// reachability data and may change between encounters.
pub struct Contact {
    id: Id,
    address: SocketAddr,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact { id, address }
    }

    /// Creates a contact with a random Id and an unspecified address.
    pub fn random() -> Contact {
        Contact::new(Id::random(), SocketAddrV4::new(0.into(), 0).into())
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    // === Public Methods ===

    /// Returns a copy of this contact reachable at a different address.
    pub fn with_address(&self, address: SocketAddr) -> Contact {
        Contact::new(self.id, address)
    }

    /// Returns true if both contacts share an address, ignoring unspecified ips.
    pub fn same_address(&self, other: &Contact) -> bool {
        compare_socket_addr(&self.address, &other.address)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl Display for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

impl FromStr for Contact {
    type Err = DecodeError;

    /// Parse a contact formatted as `<hex id>@<ip>:<port>`.
    fn from_str(s: &str) -> Result<Contact, DecodeError> {
        let (id, address) = s
            .split_once('@')
            .ok_or_else(|| DecodeError::InvalidContact(s.to_string()))?;

        let address = address
            .parse::<SocketAddr>()
            .map_err(|_| DecodeError::InvalidContact(s.to_string()))?;

        Ok(Contact::new(Id::from_str(id)?, address))
    }
}

// Same as SocketAddr::eq but ignores the ip if it is unspecified for testing reasons.
pub(crate) fn compare_socket_addr(a: &SocketAddr, b: &SocketAddr) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() || b.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}
