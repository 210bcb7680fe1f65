//! Error types for the core crate

use crate::bucket::BucketId;
use crate::decode::DecodeError;
use crate::render_request::RequestId;
use crate::transport::TransportError;
use imagekeep_cache::ConfigError;

/// Errors returned by fallible [`Controller`](crate::Controller) operations.
///
/// Recoverable runtime conditions (transport failures, undecodable payloads,
/// budget overflow) are reported as events instead.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unknown bucket: {0}")]
    UnknownBucket(BucketId),

    #[error("unknown render request: {0}")]
    UnknownRequest(RequestId),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for controller operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Why an image failed to become usable.
///
/// Carried by bucket `Error` events. Neither variant is retried further: the
/// loader has already spent its retry budget on transport failures, and
/// decode failures are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
}
