//! Streaming transfer of size-unknown dumps.
//!
//! ```text
//! Dumper stdout ──> StreamingPush ──> scp -qt <dir> ──> <dir>/<db>-<ts>.sql
//!                   header | payload | filler | NUL
//! ```
//!
//! [`protocol`] holds the wire format, [`push`] the two-task transfer.

pub mod protocol;
pub mod push;

pub use protocol::{DECLARED_SIZE, FILLER_LEN, SINK_COPY_BUFLEN};
pub use push::{PushConfig, PushStats, StreamingPush, DEFAULT_PUSH_TIMEOUT};
