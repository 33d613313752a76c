//! Transport seam
//!
//! The pipeline only needs the local node's address, for diagnostics.

use crate::types::Address;

pub trait Transport: Send + Sync {
    /// Address of this node
    fn address(&self) -> Address;
}

/// Transport of a node that does not talk to peers
pub struct LocalTransport {
    address: Address,
}

impl LocalTransport {
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(Address::from("local"))
    }
}

impl Transport for LocalTransport {
    fn address(&self) -> Address {
        self.address.clone()
    }
}
