//! Error taxonomy shared by every layer above the device backends.

/// Errors surfaced to callers of the core API.
///
/// `InvalidArgument` and `UnknownDevice` are caller mistakes and are always
/// recoverable. `DeviceFault` means the hardware failed even after the
/// single reset-and-retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A request parameter failed validation.
    #[error("{0}")]
    InvalidArgument(String),

    /// No registered device carries the requested id.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The device failed and could not be recovered.
    #[error("device {device} fault: {reason}")]
    DeviceFault { device: String, reason: String },
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// True for errors caused by the request rather than the hardware.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::UnknownDevice(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Low-level failure reported by an [`EntropyDevice`](crate::EntropyDevice)
/// backend. The wrapper turns these into [`Error::DeviceFault`] once its
/// retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DeviceError(pub String);

impl DeviceError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors_classified() {
        assert!(Error::invalid("length must be greater than 0").is_caller_error());
        assert!(Error::UnknownDevice("QWR4A003".into()).is_caller_error());
        let fault = Error::DeviceFault {
            device: "QWR4A003".into(),
            reason: "timeout".into(),
        };
        assert!(!fault.is_caller_error());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::invalid("size must be greater than 0").to_string(),
            "size must be greater than 0"
        );
        let fault = Error::DeviceFault {
            device: "QWR4A003".into(),
            reason: "usb transfer failed".into(),
        };
        assert_eq!(fault.to_string(), "device QWR4A003 fault: usb transfer failed");
    }

    #[test]
    fn test_device_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: DeviceError = io.into();
        assert_eq!(err.to_string(), "pipe closed");
    }
}
