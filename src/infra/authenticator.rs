//! The authentication engine: resolves a submitted credential to an
//! allow/deny decision plus an identity record, through a sequence of
//! directory operations (bind as the user, optionally look up a DN,
//! optionally re-verify with a search filter, optionally check group
//! membership, optionally fetch auxiliary attributes).
//!
//! Denials are values (`Ok(None)`); only connectivity and protocol faults
//! escape as errors. The hub-facing message stays a uniform "invalid
//! credentials" while the operator-facing log tells the stages apart.

use itertools::Itertools;
use regex::Regex;
use tracing::{debug, error, instrument, warn};

use crate::domain::{
    directory::{BindOutcome, DirectoryConnector, DirectorySession, SearchScope},
    error::{Error, Result},
    template,
    types::{AuthRequest, Identity, ResolvedIdentity},
};
use crate::infra::configuration::{Configuration, GroupSearchStrategy};
use crate::infra::ldap_backend::LdapBackend;

/// Active Directory extensible-match rule resolving transitive (nested)
/// group membership server-side.
const LDAP_MATCHING_RULE_IN_CHAIN: &str = "1.2.840.113556.1.4.1941";

pub struct LdapAuthenticator<C> {
    config: Configuration,
    username_pattern: Regex,
    connector: C,
}

impl LdapAuthenticator<LdapBackend> {
    /// Builds an authenticator talking to the server named by the
    /// configuration.
    pub fn from_config(config: Configuration) -> Result<Self> {
        let config = config.normalize();
        let backend = LdapBackend::from_config(&config);
        Self::new(config, backend)
    }
}

impl<C: DirectoryConnector> LdapAuthenticator<C> {
    pub fn new(config: Configuration, connector: C) -> Result<Self> {
        let config = config.normalize();
        config.validate()?;
        let username_pattern = Regex::new(&config.valid_username_regex)
            .map_err(|e| Error::InvalidConfiguration(format!("bad 'valid_username_regex': {}", e)))?;
        Ok(Self {
            config,
            username_pattern,
            connector,
        })
    }

    /// Runs one authentication attempt. `Ok(None)` is a deny; the reason
    /// is only visible in the log so that callers cannot tell a wrong
    /// password from a failed group check.
    #[instrument(skip_all, fields(username = %request.login))]
    pub async fn authenticate(&self, request: AuthRequest) -> Result<Option<Identity>> {
        if !self.validate_request(&request) {
            return Ok(None);
        }

        let mut service_session: Option<Box<dyn DirectorySession>> = None;

        let resolved = if self.config.lookup_dn {
            let Some(mut session) = self.open_service_session().await? else {
                return Ok(None);
            };
            let resolved = self.resolve_username(session.as_mut(), &request.login).await?;
            service_session = Some(session);
            match resolved {
                Some(resolved) => resolved,
                None => return Ok(None),
            }
        } else {
            ResolvedIdentity::from_login(&request.login)
        };

        let Some((mut user_session, userdn)) = self.bind_user(&request, &resolved).await? else {
            return Ok(None);
        };
        let username = resolved.bind_name().to_owned();

        if !self.config.search_filter.is_empty()
            && !self
                .verify_search_filter(user_session.as_mut(), &username)
                .await?
        {
            return Ok(None);
        }

        let mut matched_groups = Vec::new();
        if !self.config.allowed_groups.is_empty() {
            if self.config.use_search_user_to_check_groups && service_session.is_none() {
                let Some(session) = self.open_service_session().await? else {
                    return Ok(None);
                };
                service_session = Some(session);
            }
            let session = match (
                self.config.use_search_user_to_check_groups,
                service_session.as_mut(),
            ) {
                (true, Some(service)) => service.as_mut(),
                _ => user_session.as_mut(),
            };
            match self.authorize_groups(session, &username, &userdn).await? {
                Some(groups) => matched_groups = groups,
                None => {
                    warn!(username = %username, "User not in any of the allowed groups");
                    return Ok(None);
                }
            }
        }

        let name = if self.config.use_lookup_dn_username {
            username
        } else {
            request.login.clone()
        };

        let attributes = self.fetch_auth_state(user_session.as_mut(), &userdn).await?;
        if !attributes.is_empty() {
            debug!(username = %name, ?attributes, "Collected auth state attributes");
        }

        let _ = user_session.unbind().await;
        if let Some(mut session) = service_session {
            let _ = session.unbind().await;
        }

        Ok(Some(Identity {
            name,
            attributes,
            groups: matched_groups,
        }))
    }

    /// Static allow rules layered on top of `authenticate`: an allow-all
    /// switch, a user allow-list, and the directory groups recorded on
    /// the identity. With no allow rule configured at all, every
    /// authenticated user may log in.
    pub fn check_allowed(&self, username: &str, identity: &Identity) -> bool {
        if self.config.allow_all {
            return true;
        }
        if self.config.allowed_users.iter().any(|u| u == username) {
            return true;
        }
        if !self.config.allowed_groups.is_empty() && !identity.groups.is_empty() {
            return true;
        }
        self.config.allowed_users.is_empty() && self.config.allowed_groups.is_empty()
    }

    fn validate_request(&self, request: &AuthRequest) -> bool {
        if !self.username_pattern.is_match(&request.login) {
            warn!(
                username = %request.login,
                pattern = %self.config.valid_username_regex,
                "Illegal characters in username",
            );
            return false;
        }
        if request.password.trim().is_empty() {
            warn!(username = %request.login, "Login denied for blank password");
            return false;
        }
        true
    }

    /// Opens and binds the technical-account connection used for lookups
    /// and, optionally, group searches. An anonymous bind is used when no
    /// technical account is configured. A rejected bind is a service
    /// misconfiguration, not a user error, and denies the attempt.
    async fn open_service_session(&self) -> Result<Option<Box<dyn DirectorySession>>> {
        let mut session = self.connector.connect().await?;
        let search_dn = self.config.lookup_dn_search_user.as_deref().unwrap_or("");
        let password = self
            .config
            .lookup_dn_search_password
            .as_deref()
            .unwrap_or("");
        match session.simple_bind(search_dn, password).await? {
            BindOutcome::Bound => Ok(Some(session)),
            BindOutcome::InvalidCredentials => {
                error!(
                    search_user = search_dn,
                    "Failed to bind to the directory server with the lookup account",
                );
                Ok(None)
            }
        }
    }

    /// Looks up the entry matching the submitted login and returns its
    /// canonical username attribute together with its DN. The match must
    /// be unique: zero and multiple entries both deny.
    async fn resolve_username(
        &self,
        session: &mut dyn DirectorySession,
        login: &str,
    ) -> Result<Option<ResolvedIdentity>> {
        // validate() guarantees these are set when lookup_dn is enabled
        let user_attribute = self.config.user_attribute.as_deref().unwrap_or_default();
        let target_attribute = self
            .config
            .lookup_dn_user_dn_attribute
            .as_deref()
            .unwrap_or_default();
        let search_base = self.config.user_search_base.as_deref().unwrap_or_default();

        let filter = template::render_filter(
            &self.config.lookup_dn_search_filter,
            &[("login_attr", user_attribute), ("login", login)],
        );
        debug!(search_base, filter = %filter, attribute = target_attribute, "Looking up user");
        let entries = session
            .search(
                search_base,
                SearchScope::Subtree,
                &filter,
                &[target_attribute.to_owned()],
            )
            .await?;

        let entry = match entries.as_slice() {
            [] => {
                warn!(
                    username = login,
                    attribute = user_attribute,
                    "No entry found for user",
                );
                return Ok(None);
            }
            [entry] => entry,
            _ => {
                error!(
                    username = login,
                    matches = entries.len(),
                    "Ambiguous lookup, multiple entries match the user",
                );
                return Ok(None);
            }
        };

        let Some(values) = entry.attribute(target_attribute).filter(|v| !v.is_empty()) else {
            warn!(
                username = login,
                attribute = target_attribute,
                "Lookup entry carries no value for the DN attribute",
            );
            return Ok(None);
        };
        if values.len() > 1 {
            warn!(
                username = login,
                attribute = target_attribute,
                kept = %values[0],
                discarded = %values[1..].iter().join(", "),
                "Multi-valued lookup attribute, using the first value",
            );
        }

        Ok(Some(ResolvedIdentity {
            login: login.to_owned(),
            resolved_username: Some(values[0].clone()),
            distinguished_name: Some(entry.dn.clone()),
        }))
    }

    /// Tries each candidate bind DN in order with the submitted password,
    /// on a fresh connection each, and keeps the first session that
    /// binds. Rejected credentials move on to the next candidate;
    /// transport faults abort the attempt.
    async fn bind_user(
        &self,
        request: &AuthRequest,
        resolved: &ResolvedIdentity,
    ) -> Result<Option<(Box<dyn DirectorySession>, String)>> {
        let bind_name = resolved.bind_name();
        let candidate_dns: Vec<String> = if !self.config.bind_dn_template.is_empty() {
            self.config
                .bind_dn_template
                .iter()
                .map(|t| template::render_dn(t, &[("username", bind_name)]))
                .collect()
        } else {
            // Lookup mode without a template: bind as the resolved DN.
            resolved.distinguished_name.iter().cloned().collect()
        };

        for userdn in candidate_dns {
            debug!(username = bind_name, userdn = %userdn, "Attempting bind");
            let mut session = self.connector.connect().await?;
            match session.simple_bind(&userdn, &request.password).await? {
                BindOutcome::Bound => {
                    debug!(username = bind_name, userdn = %userdn, "Bind succeeded");
                    return Ok(Some((session, userdn)));
                }
                BindOutcome::InvalidCredentials => {
                    debug!(username = bind_name, userdn = %userdn, "Bind rejected");
                }
            }
        }

        match &resolved.resolved_username {
            Some(resolved_username) if *resolved_username != resolved.login => warn!(
                username = %resolved.login,
                resolved_username = %resolved_username,
                "Invalid password for user",
            ),
            _ => warn!(username = %resolved.login, "Invalid password for user"),
        }
        Ok(None)
    }

    /// Re-queries the directory with the configured search filter and
    /// requires the bound user to match it exactly once.
    async fn verify_search_filter(
        &self,
        session: &mut dyn DirectorySession,
        username: &str,
    ) -> Result<bool> {
        let user_attribute = self.config.user_attribute.as_deref().unwrap_or_default();
        let search_base = self.config.user_search_base.as_deref().unwrap_or_default();
        let filter = template::render_filter(
            &self.config.search_filter,
            &[("userattr", user_attribute), ("username", username)],
        );
        let entries = session
            .search(
                search_base,
                SearchScope::Subtree,
                &filter,
                &self.config.attributes,
            )
            .await?;
        match entries.len() {
            0 => {
                warn!(username, filter = %filter, "User not found in directory");
                Ok(false)
            }
            1 => Ok(true),
            n => {
                warn!(username, matches = n, "Duplicate users found in directory");
                Ok(false)
            }
        }
    }

    /// Checks the bound user against the allowed groups, stopping at the
    /// first match. Returns the matched group DNs, or `None` when no
    /// group admits the user.
    async fn authorize_groups(
        &self,
        session: &mut dyn DirectorySession,
        username: &str,
        userdn: &str,
    ) -> Result<Option<Vec<String>>> {
        match self.config.group_search_strategy {
            GroupSearchStrategy::Direct => {
                for group in &self.config.allowed_groups {
                    let filter = template::render_filter(
                        &self.config.group_search_filter,
                        &[("userdn", userdn), ("uid", username)],
                    );
                    debug!(group = %group, filter = %filter, "Searching group for membership");
                    let entries = session
                        .search(
                            group,
                            SearchScope::Base,
                            &filter,
                            &self.config.group_attributes,
                        )
                        .await?;
                    if !entries.is_empty() {
                        debug!(username, group = %group, "Group membership confirmed");
                        return Ok(Some(vec![group.clone()]));
                    }
                }
                Ok(None)
            }
            GroupSearchStrategy::MemberOf => {
                let entries = session
                    .search(
                        userdn,
                        SearchScope::Base,
                        "(objectClass=*)",
                        &[self.config.member_of_attribute.clone()],
                    )
                    .await?;
                let member_of: Vec<String> = entries
                    .first()
                    .and_then(|entry| entry.attribute(&self.config.member_of_attribute))
                    .map(|values| values.iter().map(|v| v.to_ascii_lowercase()).collect())
                    .unwrap_or_default();
                let matched: Vec<String> = self
                    .config
                    .allowed_groups
                    .iter()
                    .filter(|group| member_of.contains(&group.to_ascii_lowercase()))
                    .cloned()
                    .collect();
                if matched.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(matched))
                }
            }
            GroupSearchStrategy::Nested => {
                let filter_template = format!(
                    "({}:{}:={{group}})",
                    self.config.member_of_attribute, LDAP_MATCHING_RULE_IN_CHAIN
                );
                for group in &self.config.allowed_groups {
                    let filter =
                        template::render_filter(&filter_template, &[("group", group)]);
                    debug!(userdn, filter = %filter, "Searching for transitive group membership");
                    let entries = session
                        .search(userdn, SearchScope::Base, &filter, &[])
                        .await?;
                    if !entries.is_empty() {
                        debug!(username, group = %group, "Nested group membership confirmed");
                        return Ok(Some(vec![group.clone()]));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Fetches the configured auxiliary attributes off the bound entry.
    /// Absence is not a denial: a missing entry yields an empty map.
    async fn fetch_auth_state(
        &self,
        session: &mut dyn DirectorySession,
        userdn: &str,
    ) -> Result<std::collections::HashMap<String, Vec<String>>> {
        if self.config.auth_state_attributes.is_empty() {
            return Ok(Default::default());
        }
        let entries = session
            .search(
                userdn,
                SearchScope::Subtree,
                "(objectClass=*)",
                &self.config.auth_state_attributes,
            )
            .await?;
        Ok(entries
            .into_iter()
            .next()
            .map(|entry| entry.attrs)
            .unwrap_or_default())
    }
}
