//! `ldap3`-backed implementation of the directory client abstraction.

use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchResult};

use crate::domain::directory::{
    BindOutcome, DirectoryConnector, DirectoryError, DirectorySession, Entry, SearchScope,
};
use crate::infra::configuration::{Configuration, TlsStrategy};

// LDAP result codes the session layer cares about.
const RC_SUCCESS: u32 = 0;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_DN_SYNTAX: u32 = 34;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_UNWILLING_TO_PERFORM: u32 = 53;

pub struct LdapBackend {
    url: String,
    starttls: bool,
    timeout: Duration,
}

impl LdapBackend {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            url: config.server_url(),
            starttls: config.tls_strategy == TlsStrategy::BeforeBind,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }
}

#[async_trait]
impl DirectoryConnector for LdapBackend {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>, DirectoryError> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.timeout)
            .set_starttls(self.starttls);
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &self.url)
            .await
            .map_err(|e| DirectoryError::Connection(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                tracing::error!("LDAP connection driver error: {}", e);
            }
        });
        Ok(Box::new(LdapSession {
            ldap,
            timeout: self.timeout,
        }))
    }
}

struct LdapSession {
    ldap: Ldap,
    timeout: Duration,
}

#[async_trait]
impl DirectorySession for LdapSession {
    async fn simple_bind(
        &mut self,
        dn: &str,
        password: &str,
    ) -> Result<BindOutcome, DirectoryError> {
        let result = self
            .ldap
            .with_timeout(self.timeout)
            .simple_bind(dn, password)
            .await
            .map_err(|e| DirectoryError::Protocol(e.to_string()))?;
        match result.rc {
            RC_SUCCESS => Ok(BindOutcome::Bound),
            // Malformed or rejected credentials are a normal outcome for
            // the caller, which may have more bind candidates to try.
            RC_INVALID_CREDENTIALS | RC_INVALID_DN_SYNTAX | RC_UNWILLING_TO_PERFORM => {
                Ok(BindOutcome::InvalidCredentials)
            }
            rc => Err(DirectoryError::Protocol(format!(
                "bind failed with result code {}: {}",
                rc, result.text
            ))),
        }
    }

    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<Entry>, DirectoryError> {
        let scope = match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::Subtree => Scope::Subtree,
        };
        let SearchResult(entries, result) = self
            .ldap
            .with_timeout(self.timeout)
            .search(base, scope, filter, attributes)
            .await
            .map_err(|e| DirectoryError::Protocol(e.to_string()))?;
        match result.rc {
            RC_SUCCESS => Ok(entries
                .into_iter()
                .map(SearchEntry::construct)
                .map(|entry| Entry {
                    dn: entry.dn,
                    attrs: entry.attrs,
                })
                .collect()),
            // An absent search base matches nothing instead of failing
            // the whole attempt.
            RC_NO_SUCH_OBJECT => Ok(Vec::new()),
            rc => Err(DirectoryError::Protocol(format!(
                "search failed with result code {}: {}",
                rc, result.text
            ))),
        }
    }

    async fn unbind(&mut self) -> Result<(), DirectoryError> {
        self.ldap
            .unbind()
            .await
            .map_err(|e| DirectoryError::Protocol(e.to_string()))
    }
}
