//! Wire protocol spoken over the control connection.
//!
//! Every frame is a JSON text message:
//! - [`InboundFrame`] - envelopes received from the relay
//! - [`OutgoingMessage`] - responses and session events sent back
//!
//! Also provides type-safe ID wrappers for compile-time safety.

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;
