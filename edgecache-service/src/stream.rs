//! The byte stream type shared by origin reads and response bodies.

use futures_util::stream::BoxStream;

/// Object bytes as read from the origin or sent to a client. An error item ends the stream.
pub type PayloadStream = BoxStream<'static, std::io::Result<bytes::Bytes>>;

/// Collects a [`PayloadStream`] into a `Vec<u8>`.
#[cfg(test)]
pub(crate) async fn read_to_vec(mut stream: PayloadStream) -> std::io::Result<Vec<u8>> {
    use futures_util::TryStreamExt;
    let mut payload = Vec::new();
    while let Some(chunk) = stream.try_next().await? {
        payload.extend(&chunk);
    }
    Ok(payload)
}
