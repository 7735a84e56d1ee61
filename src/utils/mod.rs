pub mod error;
pub mod lines;
pub mod logger;
pub mod validation;
