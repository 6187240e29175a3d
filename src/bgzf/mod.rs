//! Streaming BGZF (blocked gzip) decoding (spec §3/§4.G-H).

pub mod block;
pub mod reader;

pub use block::{BgzfBlockDescriptor, BgzfFrame};
pub use reader::{BgzfDelegate, BgzfReader};
