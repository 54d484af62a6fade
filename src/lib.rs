pub mod domain;
pub mod infra;

pub use domain::directory::{DirectoryConnector, DirectorySession};
pub use domain::error::{Error, Result};
pub use domain::types::{AuthRequest, Identity};
pub use infra::authenticator::LdapAuthenticator;
pub use infra::configuration::Configuration;
