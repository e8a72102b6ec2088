pub mod auth;
pub mod provider;

pub use provider::{resolve_with_retry, PlaystationService};
