//! Frame types exchanged between the runner and the in-sandbox helper.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Wire protocol version. Bumped on every incompatible change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error code: frame body was not valid JSON or not a known frame shape.
pub const ERR_BAD_FRAME: u32 = 1;
/// Error code: frame type is not understood by this helper.
pub const ERR_UNKNOWN_TYPE: u32 = 2;
/// Error code: the requested command could not be spawned.
pub const ERR_SPAWN_FAILED: u32 = 3;

/// A single control-channel frame.
///
/// The first frame on every connection must be [`Frame::Hello`] from the
/// client, answered by the helper's own `HELLO` carrying its
/// [`PROTOCOL_VERSION`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Version handshake, sent by both sides.
    #[serde(rename = "HELLO")]
    Hello {
        /// Correlation id (echoed in the reply).
        id: u64,
        /// Protocol version of the sender.
        version: u32,
    },

    /// Execute a command inside the sandbox.
    #[serde(rename = "RUN")]
    Run {
        /// Correlation id for the matching `READY`/`RESULT`.
        id: u64,
        /// Full argv, `argv[0]` is the executable.
        argv: Vec<String>,
        /// Environment overlay applied on top of the sandbox environment.
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// When true the helper replies with a `RESULT` frame carrying the
        /// exit status and captured output streams.
        #[serde(default)]
        wait: bool,
        /// Inherit the helper's stdio instead of capturing.
        #[serde(default)]
        attach_stdio: bool,
    },

    /// Acknowledges a `RUN`: the child process has been spawned.
    #[serde(rename = "READY")]
    Ready {
        /// Correlation id of the `RUN`.
        id: u64,
        /// PID of the spawned child inside the sandbox.
        pid: i32,
    },

    /// Exit status of a `RUN` with `wait = true` (or of the sandboxed
    /// program itself).
    #[serde(rename = "RESULT")]
    Result {
        /// Correlation id of the `RUN`.
        id: u64,
        /// Exit code (`-1` if killed by a signal).
        code: i32,
        /// Captured stdout (empty when stdio was attached).
        #[serde(default)]
        stdout: String,
        /// Captured stderr (empty when stdio was attached).
        #[serde(default)]
        stderr: String,
    },

    /// Liveness probe.
    #[serde(rename = "PING")]
    Ping {
        /// Correlation id echoed in the `PONG`.
        id: u64,
    },

    /// Reply to `PING`.
    #[serde(rename = "PONG")]
    Pong {
        /// Correlation id of the `PING`.
        id: u64,
    },

    /// Terminate all sandbox children and exit the helper.
    #[serde(rename = "SHUTDOWN")]
    Shutdown {
        /// Correlation id.
        id: u64,
    },

    /// Failure reply. Unknown frame types are answered with this and the
    /// connection continues.
    #[serde(rename = "ERROR")]
    Error {
        /// Correlation id of the offending frame (0 if it had none).
        id: u64,
        /// One of the `ERR_*` codes.
        code: u32,
        /// Human-readable detail.
        msg: String,
    },
}

impl Frame {
    /// Correlation id of this frame.
    pub fn id(&self) -> u64 {
        match self {
            Self::Hello { id, .. }
            | Self::Run { id, .. }
            | Self::Ready { id, .. }
            | Self::Result { id, .. }
            | Self::Ping { id }
            | Self::Pong { id }
            | Self::Shutdown { id }
            | Self::Error { id, .. } => *id,
        }
    }
}
