//! Wire protocol and framed TCP streams for daemon/worker communication.

pub mod protocol;
pub mod streams;

/// Version reported by `Request::GetVersion`.
pub const PROTOCOL_VERSION: u32 = 1;
