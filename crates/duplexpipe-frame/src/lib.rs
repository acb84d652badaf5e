//! Length-prefixed message framing for duplex pipes.
//!
//! Every message is a 4-byte little-endian payload length followed by the
//! payload. Zero-length frames are valid. No partial reads, no buffer
//! management in user code.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{decode_frame, encode_frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
