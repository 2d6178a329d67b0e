//! Common utilities used by other vkern crates.
//!
//! This is an internal crate for iteration helpers that are shared between
//! the layout crate and the kernels, mainly ways of splitting an index range
//! into pieces which can be handed to worker threads.

pub mod iter;
