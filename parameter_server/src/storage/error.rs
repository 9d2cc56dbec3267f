use std::{
    error::Error,
    fmt::{self, Display},
};

/// The specific result type for the storage module.
pub type Result<T> = std::result::Result<T, StoreErr>;

/// Errors returned by the `VariableStore` when a request can't be served.
///
/// They are sent back to the requesting session as an error message, they never
/// take the coordination endpoint down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreErr {
    Uninitialized(String),
    SizeMismatch {
        name: String,
        got: usize,
        expected: usize,
    },
}

impl Display for StoreErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized(name) => write!(f, "variable `{name}` is not initialized"),
            Self::SizeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "size mismatch for variable `{name}`: got {got} values, expected {expected}"
            ),
        }
    }
}

impl Error for StoreErr {}
