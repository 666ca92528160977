//! # Composition
//!
//! The terminal step of every plan: concatenating segments in order, or
//! binding an audio track to a video with explicit offset and length
//! reconciliation.

pub mod compositor;
pub mod policy;

// Re-exports for convenience
pub use compositor::Compositor;
pub use policy::{AttachOptions, BoundaryPolicy, LengthPolicy};
