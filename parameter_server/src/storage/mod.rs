mod error;
mod store;
mod variable;

pub use error::{Result, StoreErr};
pub use store::{InitState, VariableStore};
use variable::Variable;
