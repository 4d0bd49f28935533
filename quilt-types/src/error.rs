//! Error types for Quilt wire codecs.

use thiserror::Error;

/// Errors produced by the message codec.
#[derive(Debug, Error)]
pub enum MessageError {
    /// MessagePack serialization failed.
    #[error("message encoding failed: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed.
    #[error("message decoding failed: {0}")]
    Decode(#[source] rmp_serde::decode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MessageError>();
    }
}
