use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Scope of a directory search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    /// Match only the entry named by the search base.
    Base,
    /// Match every entry below the search base.
    Subtree,
}

/// A directory entry as returned by a search.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

impl Entry {
    /// Attribute lookup, case-insensitive in the attribute name as
    /// directory servers are free to return any casing.
    pub fn attribute(&self, name: &str) -> Option<&Vec<String>> {
        self.attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }
}

/// Outcome of a bind attempt that reached the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// The server rejected the DN/password pair. Not a transport fault:
    /// the caller may try another bind candidate.
    InvalidCredentials,
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Could not reach the directory server: `{0}`")]
    Connection(String),
    #[error("Directory protocol error: `{0}`")]
    Protocol(String),
}

/// Opens sessions against the directory server. One implementation talks
/// `ldap3`, tests substitute in-memory fakes.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>, DirectoryError>;
}

/// An open session with the directory server: the minimal bind / search /
/// unbind surface the authenticator needs.
///
/// Sessions are exclusively owned by the stage that opened them and are
/// released when dropped; `unbind` additionally performs an orderly
/// protocol-level close.
#[async_trait]
pub trait DirectorySession: Send {
    async fn simple_bind(
        &mut self,
        dn: &str,
        password: &str,
    ) -> Result<BindOutcome, DirectoryError>;

    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<Entry>, DirectoryError>;

    async fn unbind(&mut self) -> Result<(), DirectoryError>;
}
