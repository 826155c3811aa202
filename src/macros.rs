//! Small declarative macros used to keep the wire-protocol tables
//! (error codes, command codes, protocol versions) next to their data
//! instead of hand-written next to boilerplate.

/// Defines a flat table of numeric error codes plus a human-readable
/// message lookup (`get_error_message`). Unknown codes fall back to
/// `"Error code: N"`.
macro_rules! define_error_codes {
    ( $( $name:ident = $val:expr => $msg:expr ),+ $(,)? ) => {
        $(
            #[allow(dead_code)]
            pub const $name: u32 = $val;
        )+

        /// Maps a numeric error code to a human-readable description.
        /// Codes with no table entry render as `"Error code: N"`.
        pub fn get_error_message(code: u32) -> String {
            match code {
                $( $val => $msg.to_string(), )+
                _ => format!("Error code: {}", code),
            }
        }
    };
}

/// Defines the `CommandType` enum from a list of `Name = code` pairs and
/// a `from_u32` reverse lookup.
macro_rules! define_command_type {
    ( $( $name:ident = $val:expr ),+ $(,)? ) => {
        /// Tuya wire command codes (the `cmd` field of a frame header).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $( $name = $val, )+
        }

        impl CommandType {
            /// Reverse lookup from a raw command code, if it is known.
            pub fn from_u32(v: u32) -> Option<Self> {
                match v {
                    $( $val => Some(CommandType::$name), )+
                    _ => None,
                }
            }
        }
    };
}

/// Defines the `Version` enum from a list of `Name = ("wire-string", numeric)`
/// pairs, plus an implicit `Auto` variant used before a device's protocol
/// version has been resolved.
macro_rules! define_version {
    ( $( $name:ident = ($s:expr, $v:expr) ),+ $(,)? ) => {
        /// Tuya LAN protocol generation. `Auto` means "not yet known";
        /// it is resolved by discovery or set explicitly by the caller.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Version {
            $( $name, )+
            /// Unresolved / auto-detect placeholder.
            Auto,
        }

        impl Version {
            /// Numeric value used for version comparisons (e.g. `>= 3.4`).
            /// `Auto` compares below every known version.
            pub fn val(&self) -> f32 {
                match self {
                    $( Version::$name => $v, )+
                    Version::Auto => 0.0,
                }
            }

            /// The 3-character ASCII version string used in the wire
            /// version header (e.g. `"3.3"`). Empty for `Auto`.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Version::$name => $s, )+
                    Version::Auto => "",
                }
            }

            /// `as_str()` as bytes, for splicing into the version header.
            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if matches!(self, Version::Auto) {
                    write!(f, "Auto")
                } else {
                    write!(f, "{}", self.as_str())
                }
            }
        }

        impl std::str::FromStr for Version {
            type Err = crate::error::TuyaError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $s => Ok(Version::$name), )+
                    "Auto" | "auto" | "" => Ok(Version::Auto),
                    other => Err(crate::error::TuyaError::UnsupportedVersion(other.to_string())),
                }
            }
        }

        impl From<&str> for Version {
            fn from(s: &str) -> Self {
                s.parse().unwrap_or(Version::Auto)
            }
        }

        impl From<String> for Version {
            fn from(s: String) -> Self {
                s.as_str().into()
            }
        }

        impl From<f32> for Version {
            fn from(v: f32) -> Self {
                $( if (v - $v).abs() < 0.01 { return Version::$name; } )+
                Version::Auto
            }
        }
    };
}
