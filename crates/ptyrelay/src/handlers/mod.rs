//! HTTP request handlers.

mod health;
pub(crate) mod problem_details;
mod version;

pub use health::{livez, readyz};
pub use version::version;
