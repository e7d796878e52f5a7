//! Transport layer module.

pub mod host_sim;
pub mod link;
pub mod mock;
pub mod traits;

pub use host_sim::{Fault, HostSimulator, PullRecord};
pub use link::{ConnectionKind, LinkEvent, unit_size_for};
pub use mock::MockTransport;
pub use traits::{ByteSource, OtaTransport, TransportError, TransportReader};
