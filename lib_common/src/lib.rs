//! Shared building blocks for the workspace binaries.
//!
//! Everything sits behind cargo features so a binary only pulls in the
//! stacks it uses.

#[cfg(feature = "retrieve")]
pub mod retrieve;

#[cfg(feature = "tracking")]
pub mod tracking;

#[cfg(all(test, feature = "retrieve"))]
mod test_support;
