use super::ConnectionFailure;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    Validation,
    Connection,
    Execution,
    Timeout,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip)]
    pub connection: Option<ConnectionFailure>,
}

impl StepError {
    pub fn new(kind: StepErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            hint: None,
            details: None,
            connection: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Validation, "VALIDATION", message)
    }

    /// The `"<field> is null or empty"` rejection every step uses for its inputs.
    pub fn missing(field: &str) -> Self {
        Self::validation(format!("{} is null or empty", field))
    }

    pub fn connection(failure: ConnectionFailure) -> Self {
        let mut err = Self::new(
            StepErrorKind::Connection,
            failure.code(),
            failure.to_string(),
        );
        if let Some(hint) = failure.hint() {
            err.hint = Some(hint.to_string());
        }
        err.connection = Some(failure);
        err
    }

    pub fn execution(exit_code: i32, message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Execution, "EXIT_STATUS", message)
            .with_details(serde_json::json!({ "exit_code": exit_code }))
            .with_hint("Set ignore_exit_status=true to treat a non-zero exit as success.")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Timeout, "TIMEOUT", message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Cancelled, "CANCELLED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Internal, "INTERNAL", message)
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for StepError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.connection
            .as_ref()
            .map(|failure| failure as &(dyn Error + 'static))
    }
}

impl From<std::io::Error> for StepError {
    fn from(err: std::io::Error) -> Self {
        StepError::internal(err.to_string())
    }
}

impl From<ConnectionFailure> for StepError {
    fn from(failure: ConnectionFailure) -> Self {
        StepError::connection(failure)
    }
}
