//! Error types and result definitions for the tuya_lan crate.
//!
//! Variants are grouped the way the protocol spec groups them
//! (Configuration, Connect, Frame, Trailer, Crypto, Negotiation, Decode,
//! Timeout) rather than by the Rust type that produced them, so a caller
//! can match on "what kind of thing went wrong" without inspecting
//! message text. Every variant also maps to a legacy numeric error code
//! (`code()`) for collaborators still keyed off the TinyTuya code table.

use thiserror::Error;

/// Represents all possible errors that can occur when communicating with
/// a Tuya device.
#[derive(Error, Debug, Clone)]
pub enum TuyaError {
    // -- Configuration ----------------------------------------------------
    /// The local key is shorter than 16 bytes on a protocol that requires
    /// a full-length key.
    #[error("local key too short for protocol {0}")]
    KeyTooShort(String),

    /// The requested protocol version string is not one of 3.1/3.3/3.4/3.5.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// The requested device-type profile is not in the command catalog.
    #[error("unknown device profile: {0}")]
    UnknownProfile(String),

    // -- Connect ------------------------------------------------------------
    /// TCP connect failed after exhausting the configured retry budget.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// TCP connect did not complete within the configured timeout.
    #[error("connection timed out")]
    ConnectTimeout,

    // -- Frame --------------------------------------------------------------
    /// Neither the 55AA nor 6699 prefix was found in the stream.
    #[error("invalid or missing frame prefix")]
    InvalidHeader,

    /// Declared payload length exceeds the 1000-byte sanity limit.
    #[error("frame payload length {0} exceeds sanity limit")]
    FrameTooLarge(usize),

    /// The buffer did not contain as many bytes as the header declared.
    #[error("frame truncated: expected {expected} bytes, have {have}")]
    FrameTruncated {
        /// Bytes required to complete this frame.
        expected: usize,
        /// Bytes actually available.
        have: usize,
    },

    // -- Trailer (usually surfaced as `success: false`, not thrown) --------
    /// CRC-32 trailer did not match the computed checksum.
    #[error("CRC mismatch")]
    CrcMismatch,

    /// HMAC-SHA-256 trailer did not match the computed MAC.
    #[error("HMAC mismatch")]
    HmacMismatch,

    // -- Crypto ---------------------------------------------------------------
    /// PKCS#7 padding was absent or malformed after ECB decryption.
    #[error("invalid PKCS#7 padding")]
    BadPadding,

    /// AES-GCM authentication tag did not verify.
    #[error("GCM tag verification failed")]
    GcmTagInvalid,

    /// Generic encryption-side failure (bad key length, non-block-aligned
    /// input without padding, etc).
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    // -- Negotiation ------------------------------------------------------------
    /// Step 2 of session-key negotiation failed HMAC verification.
    #[error("session key negotiation: HMAC verification failed")]
    NegotiationHmacMismatch,

    /// Step 2's response was missing the device nonce / HMAC fields.
    #[error("session key negotiation: malformed response")]
    NegotiationMalformed,

    /// Step 2 arrived under an unexpected command code.
    #[error("session key negotiation: unexpected response command {0}")]
    NegotiationWrongCommand(u32),

    // -- Decode -----------------------------------------------------------------
    /// Payload bytes did not parse as JSON.
    #[error("invalid JSON payload: {0}")]
    Json(String),

    // -- Timeout ------------------------------------------------------------------
    /// The receive buffer did not fill within the configured window.
    #[error("timed out waiting for device response")]
    Timeout,

    // -- I/O and bookkeeping ------------------------------------------------------
    /// Any other I/O error (write failure, reset connection, etc).
    #[error("IO error: {0}")]
    Io(String),

    /// The device is known but currently unreachable.
    #[error("device offline")]
    Offline,

    /// Device ID already registered with a `Manager`.
    #[error("device ID '{0}' already exists")]
    DuplicateDevice(String),

    /// Device ID not found in a `Manager`'s registry.
    #[error("device ID '{0}' not found")]
    DeviceNotFound(String),
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed(err.to_string()),
            std::io::ErrorKind::TimedOut => TuyaError::Timeout,
            _ => TuyaError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    /// Legacy TinyTuya-style numeric error code for this error.
    pub fn code(&self) -> u32 {
        match self {
            TuyaError::KeyTooShort(_) => ERR_KEY_OR_VER,
            TuyaError::UnsupportedVersion(_) => ERR_KEY_OR_VER,
            TuyaError::UnknownProfile(_) => ERR_PARAMS,
            TuyaError::ConnectionFailed(_) => ERR_CONNECT,
            TuyaError::ConnectTimeout => ERR_TIMEOUT,
            TuyaError::InvalidHeader => ERR_PAYLOAD,
            TuyaError::FrameTooLarge(_) => ERR_PAYLOAD,
            TuyaError::FrameTruncated { .. } => ERR_PAYLOAD,
            TuyaError::CrcMismatch => ERR_KEY_OR_VER,
            TuyaError::HmacMismatch => ERR_KEY_OR_VER,
            TuyaError::BadPadding => ERR_KEY_OR_VER,
            TuyaError::GcmTagInvalid => ERR_KEY_OR_VER,
            TuyaError::EncryptionFailed(_) => ERR_KEY_OR_VER,
            TuyaError::NegotiationHmacMismatch => ERR_KEY_OR_VER,
            TuyaError::NegotiationMalformed => ERR_KEY_OR_VER,
            TuyaError::NegotiationWrongCommand(_) => ERR_KEY_OR_VER,
            TuyaError::Json(_) => ERR_JSON,
            TuyaError::Timeout => ERR_TIMEOUT,
            TuyaError::Io(_) => ERR_CONNECT,
            TuyaError::Offline => ERR_OFFLINE,
            TuyaError::DuplicateDevice(_) => ERR_DUPLICATE,
            TuyaError::DeviceNotFound(_) => ERR_JSON,
        }
    }

    /// Reconstructs a (lossy) error from a legacy numeric code. Used when
    /// re-raising an error across a boundary that only carries the code,
    /// not the original variant.
    pub fn from_code(code: u32) -> Self {
        match code {
            ERR_JSON => TuyaError::Json("generic JSON error".to_string()),
            ERR_CONNECT => TuyaError::ConnectionFailed("generic connection error".to_string()),
            ERR_TIMEOUT => TuyaError::Timeout,
            ERR_OFFLINE => TuyaError::Offline,
            ERR_KEY_OR_VER => {
                TuyaError::UnsupportedVersion("check device key or version".to_string())
            }
            ERR_DUPLICATE => TuyaError::DuplicateDevice("unknown ID".to_string()),
            ERR_PAYLOAD => TuyaError::InvalidHeader,
            _ => TuyaError::Io(format!("unknown error code: {}", code)),
        }
    }
}

// Legacy TinyTuya-compatible error response codes, kept so collaborators
// written against that numbering still work.
define_error_codes! {
    ERR_SUCCESS = 0 => "Connection Successful",
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_RANGE = 903 => "Specified Value Out of Range",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_STATE = 906 => "Device in Unknown State",
    ERR_FUNCTION = 907 => "Function Not Supported by Device",
    ERR_DEVTYPE = 908 => "Device22 Detected: Retry Command",
    ERR_CLOUDKEY = 909 => "Missing Tuya Cloud Key and Secret",
    ERR_CLOUDRESP = 910 => "Invalid JSON Response from Cloud",
    ERR_CLOUDTOKEN = 911 => "Unable to Get Cloud Token",
    ERR_PARAMS = 912 => "Missing Function Parameters",
    ERR_CLOUD = 913 => "Error Response from Tuya Cloud",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
    ERR_DUPLICATE = 915 => "Device ID already exists",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_code_renders_generic_message() {
        assert_eq!(get_error_message(123456), "Error code: 123456");
    }

    #[test]
    fn known_code_renders_table_message() {
        assert_eq!(
            get_error_message(ERR_KEY_OR_VER),
            "Check device key or version"
        );
    }

    #[test]
    fn round_trips_through_code() {
        let e = TuyaError::Offline;
        let code = e.code();
        assert_eq!(code, ERR_OFFLINE);
        assert!(matches!(TuyaError::from_code(code), TuyaError::Offline));
    }
}
