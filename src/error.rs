use core::fmt::{self, Display};

/// NVMe status code type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCodeType {
    /// Generic command status
    Generic,
    /// Command specific status
    CommandSpecific,
    /// Media and data integrity errors
    MediaError,
    /// Path related errors
    PathError,
    /// Vendor specific
    VendorSpecific,
}

/// NVMe command status code, as carried in a completion's status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode {
    /// Status code type
    pub sct: StatusCodeType,
    /// Status code value
    pub sc: u8,
}

impl StatusCode {
    /// Parse from a raw completion status field (phase bit included).
    pub fn from_raw(status: u16) -> Self {
        let sc = ((status >> 1) & 0xFF) as u8;
        let sct_val = ((status >> 9) & 0x7) as u8;

        let sct = match sct_val {
            0 => StatusCodeType::Generic,
            1 => StatusCodeType::CommandSpecific,
            2 => StatusCodeType::MediaError,
            3 => StatusCodeType::PathError,
            7 => StatusCodeType::VendorSpecific,
            _ => StatusCodeType::Generic,
        };

        Self { sct, sc }
    }

    /// Whether this status reports success.
    pub fn is_success(&self) -> bool {
        self.sct == StatusCodeType::Generic && self.sc == 0
    }

    /// Get human-readable description.
    pub fn description(&self) -> &'static str {
        match (self.sct, self.sc) {
            // Generic command status
            (StatusCodeType::Generic, 0x00) => "Success",
            (StatusCodeType::Generic, 0x01) => "Invalid Command Opcode",
            (StatusCodeType::Generic, 0x02) => "Invalid Field in Command",
            (StatusCodeType::Generic, 0x03) => "Command ID Conflict",
            (StatusCodeType::Generic, 0x04) => "Data Transfer Error",
            (StatusCodeType::Generic, 0x06) => "Internal Error",
            (StatusCodeType::Generic, 0x07) => "Command Abort Requested",
            (StatusCodeType::Generic, 0x08) => "Command Aborted due to SQ Deletion",
            (StatusCodeType::Generic, 0x0B) => "Invalid Namespace or Format",
            (StatusCodeType::Generic, 0x0C) => "Command Sequence Error",
            (StatusCodeType::Generic, 0x13) => "PRP Offset Invalid",

            // Command specific errors
            (StatusCodeType::CommandSpecific, 0x00) => "Completion Queue Invalid",
            (StatusCodeType::CommandSpecific, 0x01) => "Invalid Queue Identifier",
            (StatusCodeType::CommandSpecific, 0x02) => "Invalid Queue Size",
            (StatusCodeType::CommandSpecific, 0x05) => "Asynchronous Event Request Limit Exceeded",
            (StatusCodeType::CommandSpecific, 0x0D) => "Feature Identifier Not Saveable",
            (StatusCodeType::CommandSpecific, 0x0E) => "Feature Not Changeable",

            _ => "Unknown Error",
        }
    }
}

/// Contains all possible errors that can occur in the driver core.
#[derive(Debug)]
pub enum Error {
    /// Bad queue id or size, non-NVMe device, or unsupported page size.
    InvalidArgument,
    /// No free request slot on the submission queue.
    Unavailable,
    /// The controller did not reach the requested ready state in time.
    Timeout,
    /// IOMMU mapping failed.
    MappingFailure,
    /// Host memory allocation failed.
    AllocationFailure,
    /// The device completed a command with a nonzero status code.
    Device(StatusCode),
}

impl core::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => {
                write!(f, "Invalid argument")
            }
            Error::Unavailable => {
                write!(f, "No free request slot available")
            }
            Error::Timeout => {
                write!(f, "Controller ready timeout expired")
            }
            Error::MappingFailure => {
                write!(f, "IOMMU mapping failed")
            }
            Error::AllocationFailure => {
                write!(f, "Host memory allocation failed")
            }
            Error::Device(code) => {
                write!(f, "NVMe error: {}", code.description())
            }
        }
    }
}

/// Result type for driver operations.
pub type Result<T> = core::result::Result<T, Error>;
