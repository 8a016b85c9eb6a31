//! Status enum conversions
//!
//! One macro generates `as_str`, `Display` and `FromStr` so persisted status
//! columns and log fields always use the same spelling.
//!
//! # Example
//!
//! ```rust
//! use regsync_domain::impl_domain_status_conversions;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! pub enum LockState {
//!     Free,
//!     Held,
//!     Expired,
//! }
//!
//! impl_domain_status_conversions!(LockState {
//!     Free => "free",
//!     Held => "held",
//!     Expired => "expired",
//! });
//! ```

/// Implements `Display`, `FromStr` and `as_str` for fieldless status enums.
///
/// Parsing is case-insensitive; the rendered form is always the mapped
/// string. Used for every status column persisted as TEXT.
#[macro_export]
macro_rules! impl_domain_status_conversions {
    ($enum_name:ident { $($variant:ident => $str:literal),+ $(,)? }) => {
        impl $enum_name {
            /// Stable string form used in storage and on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $str,)+
                }
            }
        }

        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> ::core::result::Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($enum_name), s)),
                }
            }
        }
    };
}
