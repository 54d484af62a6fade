//! In-memory directory fixture. Answers binds and searches from a fixed
//! set of entries and records every call, so tests can assert both
//! decisions and the exact sequence of directory operations behind them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hub_ldap_auth::domain::directory::{
    BindOutcome, DirectoryConnector, DirectoryError, DirectorySession, Entry, SearchScope,
};

/// One observed directory call, tagged with the ordinal of the
/// connection it was made on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirectoryCall {
    Connect {
        conn: usize,
    },
    Bind {
        conn: usize,
        dn: String,
    },
    Search {
        conn: usize,
        base: String,
        scope: SearchScope,
        filter: String,
        attributes: Vec<String>,
    },
    Unbind {
        conn: usize,
    },
}

#[derive(Clone, Debug)]
pub struct FixtureEntry {
    pub dn: String,
    pub password: Option<String>,
    pub attrs: HashMap<String, Vec<String>>,
}

impl FixtureEntry {
    pub fn new(dn: &str, password: Option<&str>, attrs: &[(&str, &[&str])]) -> Self {
        Self {
            dn: dn.to_owned(),
            password: password.map(str::to_owned),
            attrs: attrs
                .iter()
                .map(|(name, values)| {
                    (
                        name.to_string(),
                        values.iter().map(|v| v.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }
}

#[derive(Clone)]
pub struct FixtureDirectory {
    entries: Arc<Vec<FixtureEntry>>,
    calls: Arc<Mutex<Vec<DirectoryCall>>>,
    next_conn: Arc<Mutex<usize>>,
}

pub const PEOPLE_BASE: &str = "ou=people,dc=planetexpress,dc=com";
pub const ADMIN_DN: &str = "cn=admin,dc=planetexpress,dc=com";
pub const ADMIN_PASSWORD: &str = "GoodNewsEveryone";
pub const SHIP_CREW_DN: &str = "cn=ship_crew,ou=people,dc=planetexpress,dc=com";
pub const ADMIN_STAFF_DN: &str = "cn=admin_staff,ou=people,dc=planetexpress,dc=com";
pub const FRY_DN: &str = "cn=Philip J. Fry,ou=people,dc=planetexpress,dc=com";
pub const ZOIDBERG_DN: &str = "cn=John A. Zoidberg,ou=people,dc=planetexpress,dc=com";

impl FixtureDirectory {
    pub fn new(entries: Vec<FixtureEntry>) -> Self {
        Self {
            entries: Arc::new(entries),
            calls: Arc::new(Mutex::new(Vec::new())),
            next_conn: Arc::new(Mutex::new(0)),
        }
    }

    /// The Planet Express tree: a technical account, a few crew members
    /// and the groups they belong to.
    pub fn planet_express() -> Self {
        Self::new(vec![
            FixtureEntry::new(
                ADMIN_DN,
                Some(ADMIN_PASSWORD),
                &[("objectClass", &["simpleSecurityObject"]), ("cn", &["admin"])],
            ),
            FixtureEntry::new(
                FRY_DN,
                Some("fry"),
                &[
                    ("objectClass", &["inetOrgPerson"]),
                    ("uid", &["fry"]),
                    ("cn", &["Philip J. Fry"]),
                    ("sn", &["Fry"]),
                    ("mail", &["fry@planetexpress.com"]),
                    ("ou", &["Delivering Crew"]),
                    ("employeeType", &["Delivery boy"]),
                    ("memberOf", &[SHIP_CREW_DN]),
                ],
            ),
            FixtureEntry::new(
                ZOIDBERG_DN,
                Some("zoidberg"),
                &[
                    ("objectClass", &["inetOrgPerson"]),
                    ("uid", &["zoidberg"]),
                    ("cn", &["John A. Zoidberg"]),
                    ("sn", &["Zoidberg"]),
                    ("mail", &["zoidberg@planetexpress.com"]),
                    ("ou", &["Staff"]),
                    ("employeeType", &["Doctor"]),
                    ("memberOf", &["cn=staff,ou=people,dc=planetexpress,dc=com"]),
                ],
            ),
            FixtureEntry::new(
                "cn=Hermes Conrad,ou=people,dc=planetexpress,dc=com",
                Some("hermes"),
                &[
                    ("objectClass", &["inetOrgPerson"]),
                    ("uid", &["hermes"]),
                    ("cn", &["Hermes Conrad"]),
                    ("ou", &["Office Management"]),
                    ("memberOf", &[ADMIN_STAFF_DN]),
                ],
            ),
            // Two entries sharing a uid, for duplicate-detection tests.
            FixtureEntry::new(
                "cn=amy,ou=people,dc=planetexpress,dc=com",
                Some("amy"),
                &[
                    ("objectClass", &["inetOrgPerson"]),
                    ("uid", &["amy"]),
                    ("cn", &["amy"]),
                ],
            ),
            FixtureEntry::new(
                "cn=amy intern,ou=people,dc=planetexpress,dc=com",
                Some("amy"),
                &[
                    ("objectClass", &["inetOrgPerson"]),
                    ("uid", &["amy"]),
                    ("cn", &["amy intern"]),
                ],
            ),
            FixtureEntry::new(
                SHIP_CREW_DN,
                None,
                &[
                    ("objectClass", &["groupOfNames"]),
                    ("cn", &["ship_crew"]),
                    (
                        "member",
                        &[
                            FRY_DN,
                            "cn=Turanga Leela,ou=people,dc=planetexpress,dc=com",
                            "cn=Bender Bending Rodriguez,ou=people,dc=planetexpress,dc=com",
                        ],
                    ),
                ],
            ),
            FixtureEntry::new(
                ADMIN_STAFF_DN,
                None,
                &[
                    ("objectClass", &["groupOfNames"]),
                    ("cn", &["admin_staff"]),
                    (
                        "member",
                        &[
                            "cn=Hermes Conrad,ou=people,dc=planetexpress,dc=com",
                            "cn=Hubert J. Farnsworth,ou=people,dc=planetexpress,dc=com",
                        ],
                    ),
                ],
            ),
        ])
    }

    pub fn with_entry(self, entry: FixtureEntry) -> Self {
        let mut entries = (*self.entries).clone();
        entries.push(entry);
        Self {
            entries: Arc::new(entries),
            ..self
        }
    }

    pub fn calls(&self) -> Vec<DirectoryCall> {
        self.calls.lock().unwrap().clone()
    }

    /// The DNs bound on, in order, across all connections.
    pub fn bound_dns(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DirectoryCall::Bind { dn, .. } => Some(dn),
                _ => None,
            })
            .collect()
    }

    pub fn searches(&self) -> Vec<DirectoryCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, DirectoryCall::Search { .. }))
            .collect()
    }
}

#[async_trait]
impl DirectoryConnector for FixtureDirectory {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>, DirectoryError> {
        let conn = {
            let mut next = self.next_conn.lock().unwrap();
            let conn = *next;
            *next += 1;
            conn
        };
        self.calls
            .lock()
            .unwrap()
            .push(DirectoryCall::Connect { conn });
        Ok(Box::new(FixtureSession {
            conn,
            entries: self.entries.clone(),
            calls: self.calls.clone(),
        }))
    }
}

pub struct FixtureSession {
    conn: usize,
    entries: Arc<Vec<FixtureEntry>>,
    calls: Arc<Mutex<Vec<DirectoryCall>>>,
}

#[async_trait]
impl DirectorySession for FixtureSession {
    async fn simple_bind(
        &mut self,
        dn: &str,
        password: &str,
    ) -> Result<BindOutcome, DirectoryError> {
        self.calls.lock().unwrap().push(DirectoryCall::Bind {
            conn: self.conn,
            dn: dn.to_owned(),
        });
        if dn.is_empty() && password.is_empty() {
            // Anonymous bind.
            return Ok(BindOutcome::Bound);
        }
        let outcome = self
            .entries
            .iter()
            .find(|entry| entry.dn.eq_ignore_ascii_case(dn))
            .filter(|entry| entry.password.as_deref() == Some(password))
            .map(|_| BindOutcome::Bound)
            .unwrap_or(BindOutcome::InvalidCredentials);
        Ok(outcome)
    }

    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<Entry>, DirectoryError> {
        self.calls.lock().unwrap().push(DirectoryCall::Search {
            conn: self.conn,
            base: base.to_owned(),
            scope,
            filter: filter.to_owned(),
            attributes: attributes.to_vec(),
        });
        let parsed = Filter::parse(filter)
            .map_err(|e| DirectoryError::Protocol(format!("bad filter '{}': {}", filter, e)))?;
        Ok(self
            .entries
            .iter()
            .filter(|entry| in_scope(&entry.dn, base, scope) && parsed.matches(entry))
            .map(|entry| project(entry, attributes))
            .collect())
    }

    async fn unbind(&mut self) -> Result<(), DirectoryError> {
        self.calls
            .lock()
            .unwrap()
            .push(DirectoryCall::Unbind { conn: self.conn });
        Ok(())
    }
}

fn in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
    let dn = dn.to_ascii_lowercase();
    let base = base.to_ascii_lowercase();
    match scope {
        SearchScope::Base => dn == base,
        SearchScope::Subtree => dn.ends_with(&base),
    }
}

fn project(entry: &FixtureEntry, attributes: &[String]) -> Entry {
    let attrs = if attributes.is_empty() {
        entry.attrs.clone()
    } else {
        entry
            .attrs
            .iter()
            .filter(|(name, _)| attributes.iter().any(|a| a.eq_ignore_ascii_case(name)))
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect()
    };
    Entry {
        dn: entry.dn.clone(),
        attrs,
    }
}

/// Just enough of RFC 4515 to evaluate the filters the authenticator
/// emits: and/or/not, equality, presence, and extensible matching rules
/// (treated as plain equality on the named attribute).
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equality(String, String),
}

impl Filter {
    fn parse(input: &str) -> Result<Filter, String> {
        let (filter, rest) = Self::parse_one(input.trim())?;
        if rest.is_empty() {
            Ok(filter)
        } else {
            Err(format!("trailing input: '{}'", rest))
        }
    }

    fn parse_one(input: &str) -> Result<(Filter, &str), String> {
        let rest = input.strip_prefix('(').ok_or("expected '('")?;
        match rest.chars().next() {
            Some('&') => {
                let (children, rest) = Self::parse_list(&rest[1..])?;
                Ok((Filter::And(children), expect_close(rest)?))
            }
            Some('|') => {
                let (children, rest) = Self::parse_list(&rest[1..])?;
                Ok((Filter::Or(children), expect_close(rest)?))
            }
            Some('!') => {
                let (child, rest) = Self::parse_one(&rest[1..])?;
                Ok((Filter::Not(Box::new(child)), expect_close(rest)?))
            }
            _ => {
                let end = rest.find(')').ok_or("unterminated item")?;
                let body = &rest[..end];
                let (attr, value) = body.split_once('=').ok_or("missing '='")?;
                // An extensible match like `memberOf:<oid>:=value` is
                // evaluated as equality on the attribute itself.
                let attr = attr
                    .split(':')
                    .next()
                    .filter(|a| !a.is_empty())
                    .ok_or("missing attribute")?
                    .to_owned();
                let filter = if value == "*" {
                    Filter::Present(attr)
                } else {
                    Filter::Equality(attr, unescape(value))
                };
                Ok((filter, &rest[end + 1..]))
            }
        }
    }

    fn parse_list(mut input: &str) -> Result<(Vec<Filter>, &str), String> {
        let mut children = Vec::new();
        while input.starts_with('(') {
            let (child, rest) = Self::parse_one(input)?;
            children.push(child);
            input = rest;
        }
        if children.is_empty() {
            return Err("empty filter list".to_owned());
        }
        Ok((children, input))
    }

    fn matches(&self, entry: &FixtureEntry) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|c| c.matches(entry)),
            Filter::Or(children) => children.iter().any(|c| c.matches(entry)),
            Filter::Not(child) => !child.matches(entry),
            Filter::Present(attr) => {
                attr.eq_ignore_ascii_case("objectClass")
                    || entry.attrs.keys().any(|k| k.eq_ignore_ascii_case(attr))
            }
            Filter::Equality(attr, value) => entry
                .attrs
                .iter()
                .filter(|(name, _)| name.eq_ignore_ascii_case(attr))
                .flat_map(|(_, values)| values.iter())
                .any(|v| v.eq_ignore_ascii_case(value)),
        }
    }
}

fn expect_close(input: &str) -> Result<&str, String> {
    input.strip_prefix(')').ok_or_else(|| "expected ')'".to_owned())
}

/// Undoes RFC 4515 hex escapes (`\2a` and friends) in a filter value.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            if let Some(hex) = value.get(i + 1..i + 3) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte as char);
                    chars.next();
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}
