//! Wire protocol for the collaboration hub.
//!
//! Every frame exchanged between a client and the hub is a single JSON text
//! WebSocket message shaped `{type, op_id?, data?, error?}`. `type` is a
//! dotted lowercase identifier drawn from a closed enumeration; the payload
//! carried in `data` is decoded lazily, once the discriminant has resolved
//! which shape to expect.

pub mod envelope;
pub mod error_code;
pub mod presence;
pub mod room;

pub use envelope::{Frame, InboundMessage};
pub use error_code::ErrorCode;
