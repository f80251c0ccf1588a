pub mod client;
#[cfg(test)]
pub mod mock;
pub mod stream;

pub use client::{ApiClient, ByteStream};
pub use stream::FrameParser;
