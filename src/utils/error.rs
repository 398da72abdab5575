//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;

/// Customized error type for entity operations, discovery, and setup.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EntityError(pub(crate) String);

impl EntityError {
    pub fn msg(msg: impl ToString) -> Self {
        EntityError(msg.to_string())
    }
}

impl fmt::Display for EntityError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for EntityError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `EntityError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for EntityError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                EntityError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `EntityError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for EntityError {
            fn from(e: $error) -> EntityError {
                EntityError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(serde_json::Error);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
