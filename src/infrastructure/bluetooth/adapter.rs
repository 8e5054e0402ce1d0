//! Adapter capability
//!
//! The engine never talks to a platform stack directly. Backends implement
//! [`BleAdapter`]; every call is a request whose completion is the returned
//! future, and discovery results arrive on a stream.

use crate::domain::address::MacAddress;
use crate::domain::models::{AdapterId, Advertisement};
use crate::error::AdapterError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use uuid::Uuid;

/// One item of a discovery stream.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Advertisement(Advertisement),
    /// The adapter failed; the stream ends after this.
    Error(String),
}

pub type DiscoveryStream = BoxStream<'static, DiscoveryEvent>;

#[async_trait]
pub trait BleAdapter: Send + Sync {
    async fn list_adapters(&self) -> Result<Vec<AdapterId>, AdapterError>;

    /// Begin discovery on `adapter`. The stream ending without a matching
    /// `stop_discovery` means the adapter went away.
    async fn start_discovery(&self, adapter: &AdapterId) -> Result<DiscoveryStream, AdapterError>;

    async fn stop_discovery(&self, adapter: &AdapterId) -> Result<(), AdapterError>;

    async fn connect(&self, address: &MacAddress) -> Result<(), AdapterError>;

    async fn disconnect(&self, address: &MacAddress) -> Result<(), AdapterError>;

    async fn discover_services(&self, address: &MacAddress) -> Result<Vec<Uuid>, AdapterError>;
}
