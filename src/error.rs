//! Error types for mirrored ring buffers.

use thiserror::Error;

/// Result type alias using this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while building, driving or tearing down a
/// [`MirroredRing`](crate::MirroredRing).
///
/// None of these are transient: each one reflects a violated precondition or
/// an OS refusal, so retrying the same call will fail the same way.
#[derive(Error, Debug)]
pub enum Error {
    /// The element type's byte size is not a power of two.
    #[error("element size {size} is not a power of two")]
    InvalidLayout { size: usize },

    /// The backing memory object could not be created or sized.
    #[error("failed to create backing region: {0:#}")]
    Allocation(anyhow::Error),

    /// The two halves could not be mapped at contiguous addresses.
    #[error("failed to mirror backing region: {0:#}")]
    Mapping(anyhow::Error),

    /// `produce` asked for more elements than there is free space.
    #[error("cannot produce {requested} elements: only {available} free")]
    Capacity { requested: usize, available: usize },

    /// `consume` asked for more elements than are filled.
    #[error("cannot consume {requested} elements: only {available} filled")]
    Underflow { requested: usize, available: usize },

    /// The OS refused to unmap the mirrored region.
    #[error("failed to release mirrored region: {0:#}")]
    Release(anyhow::Error),
}
