//! Identity endpoint lifecycle: configuration enumeration, daemon process
//! management, health probing, termination, and rotation.

pub mod daemon;
pub mod manager;
pub mod probe;
pub mod rotation;
pub mod store;
pub mod termination;

pub use daemon::{DaemonPaths, SecretFile};
pub use manager::{IdentityManager, IdentitySession};
pub use probe::{HealthProbe, TunInterfaceProbe};
pub use rotation::Rotator;
pub use store::{ConfigStore, ConfigStoreError, IdentityConfig};
