//! Wire protocol for the bubblejail helper control channel.
//!
//! Frames are UTF-8 JSON bodies prefixed with a 4-byte big-endian length,
//! carried over the UNIX stream socket the helper inherits from the runner.
//! Every frame has a `type` tag and a 64-bit correlation `id`; `RESULT`
//! frames answer the `RUN` frame with the same id.

mod codec;
mod message;

pub use codec::{recv, recv_value, send, MAX_FRAME};
pub use message::{Frame, ERR_BAD_FRAME, ERR_SPAWN_FAILED, ERR_UNKNOWN_TYPE, PROTOCOL_VERSION};
