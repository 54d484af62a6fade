use std::collections::HashMap;

/// One authentication attempt as submitted by the hub. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthRequest {
    pub login: String,
    pub password: String,
}

/// What the DN resolution stage learned about a login name.
///
/// `resolved_username` and `distinguished_name` are only populated in
/// lookup mode; they are consistent with each other once set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub login: String,
    pub resolved_username: Option<String>,
    pub distinguished_name: Option<String>,
}

impl ResolvedIdentity {
    pub fn from_login(login: &str) -> Self {
        Self {
            login: login.to_owned(),
            resolved_username: None,
            distinguished_name: None,
        }
    }

    /// The name substituted into bind DN templates and search filters:
    /// the looked-up username when there is one, the login otherwise.
    pub fn bind_name(&self) -> &str {
        self.resolved_username.as_deref().unwrap_or(&self.login)
    }
}

/// Successful authentication outcome handed back to the hub.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    /// Auxiliary directory attributes, exposed to the hub as auth state.
    pub attributes: HashMap<String, Vec<String>>,
    /// Allowed group DNs the user was found to be a member of.
    pub groups: Vec<String>,
}
