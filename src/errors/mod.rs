mod connection_error;
mod step_error;

pub use connection_error::ConnectionFailure;
pub use step_error::{StepError, StepErrorKind};
