//! Error types for store operations.

use thiserror::Error;

/// Errors that can occur during store operations.
///
/// Write operations (`add`, `remove`, `update`) never return these;
/// malformed input is signalled by a `None`/`false` return instead. The
/// errors below mark programmer misuse of the read API and are not
/// retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A replaceable lookup was issued for a kind outside the
    /// replaceable and addressable ranges.
    #[error("kind {0} is not replaceable or addressable")]
    NotReplaceable(u32),
}
