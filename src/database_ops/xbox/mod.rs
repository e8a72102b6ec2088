pub mod headers;
pub mod provider;
pub mod xbl_auth;

pub use provider::XboxService;
