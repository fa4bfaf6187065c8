use bytes::Bytes;
use std::pin::Pin;

/// A boxed async byte stream, used for blob reads, upstream bodies, and
/// response bodies. Chunk errors are `std::io::Error` so the stream can be
/// handed to axum/tokio adapters unchanged.
pub type ByteStream = Pin<Box<dyn futures_core::Stream<Item = std::io::Result<Bytes>> + Send>>;
