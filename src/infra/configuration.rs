use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::domain::{error::Error, template};

/// SSL/TLS strategy used when talking to the directory server.
///
/// The LDAP v3 protocol deprecated establishing a TLS connection directly
/// (`on_connect`, traditionally port 636) in favor of upgrading the
/// connection before binding (`before_bind`, i.e. StartTLS).
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TlsStrategy {
    BeforeBind,
    OnConnect,
    Insecure,
}

/// How group membership is established once the user is bound.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupSearchStrategy {
    /// Base-scope search against each allowed group DN with
    /// `group_search_filter`.
    Direct,
    /// Read the `memberOf`-style attribute off the user's own entry and
    /// intersect it with the allowed groups.
    MemberOf,
    /// Like `MemberOf`, but one transitive-match search per allowed group
    /// (Active Directory `LDAP_MATCHING_RULE_IN_CHAIN`), resolving nested
    /// group membership on servers that support it.
    Nested,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Configuration {
    /// Address of the LDAP server to contact, IP or hostname.
    pub server_address: String,
    /// Port to contact the LDAP server on. Defaults to 636 when
    /// `tls_strategy` is `on_connect`, 389 otherwise.
    pub server_port: Option<u16>,
    pub tls_strategy: TlsStrategy,
    /// Deprecated: `use_ssl = true` translates to
    /// `tls_strategy = "on_connect"`, `use_ssl = false` has no effect.
    pub use_ssl: Option<bool>,
    /// Template(s) from which to build the bind DN; `{username}` is
    /// replaced with the name used to log in. Accepts a single string or
    /// a list, normalized to a list at the boundary.
    #[serde(deserialize_with = "one_or_many", default)]
    pub bind_dn_template: Vec<String>,
    /// Group DNs whose members are granted access. Empty means no group
    /// check is performed.
    pub allowed_groups: Vec<String>,
    pub group_search_filter: String,
    pub group_attributes: Vec<String>,
    pub group_search_strategy: GroupSearchStrategy,
    /// Reverse-membership attribute on user entries, for the `member_of`
    /// and `nested` strategies.
    pub member_of_attribute: String,
    /// Run the group membership searches on the technical-account
    /// connection instead of the freshly-bound user connection.
    pub use_search_user_to_check_groups: bool,
    /// Logins not matching this pattern are rejected before any directory
    /// round-trip. The primary guard against LDAP injection.
    pub valid_username_regex: String,
    /// Discover the user's DN with a directory search instead of (or in
    /// addition to) `bind_dn_template`.
    pub lookup_dn: bool,
    pub user_search_base: Option<String>,
    /// Attribute holding the login name, e.g. `uid`, or `sAMAccountName`
    /// on Active Directory.
    pub user_attribute: Option<String>,
    pub lookup_dn_search_filter: String,
    /// Technical account for the lookup search; anonymous when unset.
    pub lookup_dn_search_user: Option<String>,
    pub lookup_dn_search_password: Option<String>,
    /// Attribute whose value becomes the resolved username, e.g. `cn` on
    /// Active Directory.
    pub lookup_dn_user_dn_attribute: Option<String>,
    /// Post-bind search filter; when set, the bound user must match it
    /// exactly once.
    pub search_filter: String,
    /// Attributes requested by the post-bind search.
    pub attributes: Vec<String>,
    /// Attributes attached to the returned identity for the hub to use.
    pub auth_state_attributes: Vec<String>,
    /// Return the looked-up username instead of the submitted login,
    /// for environments where the two differ.
    pub use_lookup_dn_username: bool,
    /// Static allow rules layered on top of authentication, consulted by
    /// `check_allowed`.
    pub allow_all: bool,
    pub allowed_users: Vec<String>,
    /// Connection/operation timeout handed to the directory client.
    pub timeout_seconds: u64,
    pub verbose: bool,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(template) => vec![template],
        OneOrMany::Many(templates) => templates,
    })
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            server_address: String::new(),
            server_port: None,
            tls_strategy: TlsStrategy::BeforeBind,
            use_ssl: None,
            bind_dn_template: Vec::new(),
            allowed_groups: Vec::new(),
            group_search_filter:
                "(|(member={userdn})(uniqueMember={userdn})(memberUid={uid}))".to_owned(),
            group_attributes: vec![
                "member".to_owned(),
                "uniqueMember".to_owned(),
                "memberUid".to_owned(),
            ],
            group_search_strategy: GroupSearchStrategy::Direct,
            member_of_attribute: "memberOf".to_owned(),
            use_search_user_to_check_groups: false,
            valid_username_regex: r"^[a-z][.a-z0-9_-]*$".to_owned(),
            lookup_dn: false,
            user_search_base: None,
            user_attribute: None,
            lookup_dn_search_filter: "({login_attr}={login})".to_owned(),
            lookup_dn_search_user: None,
            lookup_dn_search_password: None,
            lookup_dn_user_dn_attribute: None,
            search_filter: String::new(),
            attributes: Vec::new(),
            auth_state_attributes: Vec::new(),
            use_lookup_dn_username: true,
            allow_all: false,
            allowed_users: Vec::new(),
            timeout_seconds: 10,
            verbose: false,
        }
    }
}

impl Configuration {
    pub fn effective_port(&self) -> u16 {
        self.server_port.unwrap_or(match self.tls_strategy {
            TlsStrategy::OnConnect => 636,
            _ => 389,
        })
    }

    pub fn server_url(&self) -> String {
        let scheme = match self.tls_strategy {
            TlsStrategy::OnConnect => "ldaps",
            _ => "ldap",
        };
        format!("{}://{}:{}", scheme, self.server_address, self.effective_port())
    }

    /// Folds deprecated knobs into their replacements and drops entries
    /// that must not reach the engine. Idempotent.
    pub fn normalize(mut self) -> Self {
        if let Some(use_ssl) = self.use_ssl.take() {
            if use_ssl {
                warn!(
                    "'use_ssl' is deprecated, configure tls_strategy=\"on_connect\" \
                     from now on"
                );
                self.tls_strategy = TlsStrategy::OnConnect;
            } else {
                warn!("'use_ssl' is deprecated and 'use_ssl = false' has no effect");
            }
        }
        if self.bind_dn_template.iter().any(|t| t.trim().is_empty()) {
            warn!("Ignoring blank 'bind_dn_template' entry");
            self.bind_dn_template.retain(|t| !t.trim().is_empty());
        }
        self
    }

    /// Structural validation, run once at engine construction so that
    /// misconfiguration fails at startup instead of on the first login.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: String| Err(Error::InvalidConfiguration(message));

        if let Err(e) = Regex::new(&self.valid_username_regex) {
            return invalid(format!("bad 'valid_username_regex': {}", e));
        }
        if self.server_address.is_empty() {
            return invalid("'server_address' must be configured".to_owned());
        }
        if !self.lookup_dn && self.bind_dn_template.is_empty() {
            return invalid(
                "one of 'lookup_dn' or 'bind_dn_template' must be configured".to_owned(),
            );
        }
        for template in &self.bind_dn_template {
            if !template::placeholders(template).contains(&"username") {
                return invalid(format!(
                    "bind_dn_template '{}' is missing the {{username}} placeholder",
                    template
                ));
            }
        }
        if self.lookup_dn {
            if self.user_search_base.is_none() {
                return invalid("'lookup_dn' requires 'user_search_base'".to_owned());
            }
            if self.user_attribute.is_none() {
                return invalid("'lookup_dn' requires 'user_attribute'".to_owned());
            }
            if self.lookup_dn_user_dn_attribute.is_none() {
                return invalid(
                    "'lookup_dn' requires 'lookup_dn_user_dn_attribute'".to_owned(),
                );
            }
            if !template::placeholders(&self.lookup_dn_search_filter).contains(&"login") {
                return invalid(format!(
                    "lookup_dn_search_filter '{}' is missing the {{login}} placeholder",
                    self.lookup_dn_search_filter
                ));
            }
        }
        if !self.search_filter.is_empty() {
            if self.user_search_base.is_none() {
                return invalid("'search_filter' requires 'user_search_base'".to_owned());
            }
            let placeholders = template::placeholders(&self.search_filter);
            if !placeholders.contains(&"username") {
                return invalid(format!(
                    "search_filter '{}' is missing the {{username}} placeholder",
                    self.search_filter
                ));
            }
            if placeholders.contains(&"userattr") && self.user_attribute.is_none() {
                return invalid(
                    "search_filter references {userattr} but 'user_attribute' is not set"
                        .to_owned(),
                );
            }
        }
        if !self.allowed_groups.is_empty() {
            match self.group_search_strategy {
                GroupSearchStrategy::Direct => {
                    if self.group_search_filter.is_empty() || self.group_attributes.is_empty() {
                        return invalid(
                            "missing 'group_search_filter' or 'group_attributes', \
                             both are required for the direct group search"
                                .to_owned(),
                        );
                    }
                    let placeholders = template::placeholders(&self.group_search_filter);
                    if !placeholders.contains(&"userdn") && !placeholders.contains(&"uid") {
                        return invalid(format!(
                            "group_search_filter '{}' references neither {{userdn}} nor {{uid}}",
                            self.group_search_filter
                        ));
                    }
                }
                GroupSearchStrategy::MemberOf | GroupSearchStrategy::Nested => {
                    if self.member_of_attribute.is_empty() {
                        return invalid(
                            "'member_of_attribute' must be set for the member_of and \
                             nested group strategies"
                                .to_owned(),
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn init(config_file: &str) -> Result<Configuration> {
    let config: Configuration = Figment::from(Serialized::defaults(Configuration::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("HUB_LDAP_"))
        .extract()?;
    Ok(config.normalize())
}
