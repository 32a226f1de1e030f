//! The binary memcached-style wire protocol: opcode space, status classification,
//! and the 24-byte framed codec operations are serialized over (§4.4, §6).

mod frame;
mod opcode;
mod status;

pub use frame::{Frame, FrameCodec, Magic, HEADER_LEN};
pub use opcode::Opcode;
pub use status::Status;
