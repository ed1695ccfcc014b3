pub mod context;
pub mod credentials;
pub mod log_sink;
pub mod logger;
pub mod validation;
