//! Capabilities the failover core needs from the log service.
//!
//! The core never talks to a concrete service. It is handed a
//! [`ClientFactory`] that builds a data-plane [`StreamClient`] bound to one
//! endpoint, and (producers only) an [`AdminClient`] able to create and list
//! streams. [`local`] is a directory-backed implementation of all three.

pub mod local;

use crate::error::ServiceError;
use crate::target::{CursorPosition, TargetRef};
use crate::Result;

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub offset: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchBatch {
    pub messages: Vec<Message>,
    pub next_cursor: String,
}

/// Response of a stream creation call. The administrative API is eventually
/// consistent, so either identifier may be missing right after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatedTarget {
    pub id: Option<String>,
    pub endpoint: Option<String>,
}

impl CreatedTarget {
    pub fn into_target(self) -> Option<TargetRef> {
        match (self.id, self.endpoint) {
            (Some(id), Some(endpoint)) => {
                let target = TargetRef::new(id, endpoint);
                target.is_complete().then_some(target)
            }
            _ => None,
        }
    }
}

/// Data-plane operations against streams served by a single endpoint.
pub trait StreamClient {
    fn endpoint(&self) -> &str;

    fn create_cursor(
        &self,
        stream_id: &str,
        partition: &str,
        position: CursorPosition,
    ) -> ServiceResult<String>;

    fn fetch(&self, stream_id: &str, cursor: &str, limit: usize) -> ServiceResult<FetchBatch>;

    fn put(&self, stream_id: &str, key: &[u8], value: &[u8]) -> ServiceResult<()>;
}

/// Control-plane operations used to provision a secondary stream.
pub trait AdminClient {
    fn create_target(&self, name: &str) -> ServiceResult<CreatedTarget>;

    fn list_targets(&self, name: &str) -> ServiceResult<Vec<TargetRef>>;
}

/// Builds a fresh [`StreamClient`] for an endpoint.
///
/// Clients are never re-pointed at another endpoint; switching targets always
/// goes through `connect`.
pub trait ClientFactory {
    type Client: StreamClient;

    fn connect(&self, endpoint: &str) -> Result<Self::Client>;
}
