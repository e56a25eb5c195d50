use thiserror::Error;

/// The one recoverable failure in this crate: a requested capacity cannot be
/// represented by the control+slot layout on this platform. Every other
/// failure mode (allocator exhaustion, a violated precondition) aborts or is
/// undefined behavior instead of returning an `Err` — see the crate's error
/// handling design notes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTableError {
    #[error("requested capacity overflows the table's layout")]
    CapacityOverflow,
}

pub type Result<T> = std::result::Result<T, RawTableError>;
