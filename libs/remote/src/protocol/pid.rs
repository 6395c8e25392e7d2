//! Process Identity
//!
//! Location-transparent actor identity. `request_id` correlates one
//! request/response pair and is never part of the actor's addressable key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Location-transparent actor identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pid {
    /// Owning node address (`host:port`)
    pub address: String,
    /// Actor id within the owning node
    pub id: String,
    /// Request/response correlation, zero when unused
    pub request_id: u32,
}

/// Addressable key of a PID: address and id, request id stripped
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PidKey {
    pub address: String,
    pub id: String,
}

impl Pid {
    pub fn new(address: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            id: id.into(),
            request_id: 0,
        }
    }

    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.request_id = request_id;
        self
    }

    /// Copy of this PID with `request_id` zeroed
    pub fn normalized(&self) -> Pid {
        Pid {
            address: self.address.clone(),
            id: self.id.clone(),
            request_id: 0,
        }
    }

    /// Interning/deduplication key
    pub fn key(&self) -> PidKey {
        PidKey {
            address: self.address.clone(),
            id: self.id.clone(),
        }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.id)
    }
}
