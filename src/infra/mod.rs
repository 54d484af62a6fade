pub mod authenticator;
pub mod configuration;
pub mod ldap_backend;
pub mod logging;
