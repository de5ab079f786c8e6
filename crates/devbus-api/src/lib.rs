//! Request/reply plumbing shared by every devbus component.
//!
//! - **[`Transport`]**: the synchronous `invoke(location, operation, payload)`
//!   capability the kernel consumes, plus [`TimeoutGuard`] for scoped
//!   timeout overrides.
//! - **[`ConnectionSpec`]**: parsing of `TANGO_HOST`-style database
//!   addresses, single and multi-host, and the [`Location`] strings built
//!   from them.
//! - **[`wire`]**: the flat string-array encoding of batched property calls.
//! - **[`Error`]** / **[`Reason`]**: failures with machine-matchable reason codes.

pub mod connection;
pub mod error;
pub mod reason;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transport;
pub mod wire;

pub use connection::{ConnectionSpec, DB_OBJECT_NAME, Endpoint, Location, TANGO_HOST_ENV};
pub use error::{Error, ErrorFrame, RemoteError};
pub use reason::Reason;
pub use transport::{DEFAULT_TIMEOUT, Payload, TimeoutGuard, Transport};
pub use wire::{AttrWireFormat, AttributeProperties, DbDatum};
