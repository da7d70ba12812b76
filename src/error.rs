//! # Kernel Error Codes
//!
//! Errors surfaced by the kernel API. All errors are synchronous: they are
//! returned to the caller of the operation that triggered them and leave
//! kernel state unchanged. The kernel never retries; the only internally
//! recovered condition is the tick-counter wrap.
//!
//! Contract violations that cannot be expressed as return values — a stale
//! task handle, an ISR-unsafe call from interrupt context — are caught by
//! assertions instead.

use core::fmt;

/// Error codes returned by fallible kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// A task stack or TCB slot could not be allocated. Nothing was
    /// created; the caller may free memory or retire tasks and retry.
    OutOfMemory,

    /// A batch admission request failed the rate-monotonic utilisation
    /// test. No task from the batch was created.
    NotSchedulable,

    /// A batch admission line did not parse: unknown task type, missing
    /// field, or a field that is not a base-10 unsigned integer.
    BadBatchLine,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => f.write_str("could not allocate required memory"),
            KernelError::NotSchedulable => f.write_str("batch is not schedulable"),
            KernelError::BadBatchLine => f.write_str("malformed batch specification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            KernelError::NotSchedulable.to_string(),
            "batch is not schedulable"
        );
        assert_eq!(
            KernelError::OutOfMemory.to_string(),
            "could not allocate required memory"
        );
    }
}
