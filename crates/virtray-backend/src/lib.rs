use async_trait::async_trait;
use std::sync::Arc;
use virtray_core::{BackendError, GuestId};

pub mod fake;
#[cfg(feature = "libvirt")]
pub mod libvirt;

pub use fake::FakeHypervisor;
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtHypervisor;

/// One row of a guest enumeration, as the backend reports it. The raw status
/// string is mapped to the closed power-state enum by the fetcher; it never
/// enters the authoritative state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestListing {
    pub id: GuestId,
    pub name: String,
    pub raw_status: String,
}

/// A live connection to the virtualization backend. Methods may suspend; the
/// caller bounds every call with a timeout. `close` is idempotent and leaves
/// later calls failing with `BackendError::Closed`.
#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    async fn list_guests(&self) -> Result<Vec<GuestListing>, BackendError>;
    async fn start(&self, id: &GuestId) -> Result<(), BackendError>;
    async fn stop(&self, id: &GuestId) -> Result<(), BackendError>;
    async fn close(&self);
}

pub type SharedConnection = Arc<dyn HypervisorConnection>;

/// Factory for connections. The engine holds exactly one of these and opens
/// through it whenever the supervisor decides to (re)connect.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn open(&self) -> Result<SharedConnection, BackendError>;
}
