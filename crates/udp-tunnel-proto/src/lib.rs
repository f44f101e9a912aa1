//! UDP Tunnel Protocol Definitions
//!
//! This crate defines the wire format used to carry UDP datagrams over a TCP
//! byte stream, plus the addressing types shared by every proxy.

pub mod codec;
pub mod endpoint;
pub mod target;

pub use codec::{encode_frame, CodecError, FrameDecoder};
pub use endpoint::{Endpoint, EndpointParseError, Protocol};
pub use target::{parse_port_expression, parse_target, validate_target, TargetParseError};

/// Length header size in bytes (u16, big-endian)
pub const FRAME_HEADER_SIZE: usize = 2;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Default host for binds, connects and targets without an explicit host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Maximum number of endpoints a single target expression may expand to
pub const MAX_TARGETS_PER_EXPRESSION: usize = 1000;
