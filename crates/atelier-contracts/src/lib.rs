pub mod cache;
pub mod error;
pub mod events;
pub mod models;
pub mod prompt;
pub mod queue;
pub mod records;
pub mod request;

pub use error::ValidationError;
