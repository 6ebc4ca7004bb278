use std::result;

/// Errors surfaced by this crate. Nothing is retried internally; every
/// failure propagates to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid construction or resize parameters (sizes, group sizes,
    /// radix widths, mismatched programs).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid arguments to an operation, e.g. a missing output buffer.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// An error reported by the OpenCL runtime: program build failure,
    /// allocation failure, or a failed enqueue.
    #[error("device error: {0}")]
    Device(ocl::Error),
}

impl From<ocl::Error> for Error {
    fn from(err: ocl::Error) -> Self {
        Error::Device(err)
    }
}

pub type Result<T> = result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_displays_reason() {
        let err = Error::Config("group size (3) must be a power of two".into());
        let msg = err.to_string();
        assert!(msg.contains("invalid configuration"));
        assert!(msg.contains("power of two"));
    }
}
