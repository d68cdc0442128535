//! Fitbridge OSC Transport
//!
//! Addressed message bus between the fitbridge processes: an OSC 1.0 codec
//! that carries persisted objects as tagged strings, and a UDP actor with
//! uid-scoped handlers, confirm correlation with deadlines, and a send queue
//! held while the peer's keepalive pings are missing.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod address;
pub mod codec;
pub mod error;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use codec::{Arg, OscMessage, EMPTY_SENTINEL};
pub use error::{OscError, Result};
pub use transport::{Callback, ConfirmReply, Delivery, OscTransport, WILDCARD_UID};
