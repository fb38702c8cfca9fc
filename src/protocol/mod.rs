//! Wire-level protocol definitions shared by both ends of a stream.

pub mod wire;
