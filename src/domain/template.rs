//! Named-placeholder substitution for DN and filter templates.
//!
//! Every value substituted into a template is escaped for the context it
//! lands in: RFC 4515 filter-literal escaping inside search filters,
//! RFC 4514 attribute-value escaping inside distinguished names. Both
//! escapes come from the directory client library.

use std::borrow::Cow;

use ldap3::{dn_escape, ldap_escape};

/// Placeholder names (`{name}`) referenced by a template, in order of
/// appearance. Used to reject misconfigured templates before any request
/// is served.
pub fn placeholders(template: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        rest = &rest[start + 1..];
        match rest.find('}') {
            Some(end) => {
                names.push(&rest[..end]);
                rest = &rest[end + 1..];
            }
            None => break,
        }
    }
    names
}

/// Renders a search-filter template, escaping every substituted value as
/// an RFC 4515 filter literal.
pub fn render_filter(template: &str, values: &[(&str, &str)]) -> String {
    render_with(template, values, ldap_escape)
}

/// Renders a DN template, escaping every substituted value as an RFC 4514
/// DN attribute value.
pub fn render_dn(template: &str, values: &[(&str, &str)]) -> String {
    render_with(template, values, dn_escape)
}

fn render_with<'a>(
    template: &str,
    values: &[(&str, &'a str)],
    escape: impl Fn(&'a str) -> Cow<'a, str>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match values.iter().find(|(key, _)| *key == name) {
                    Some((_, value)) => out.push_str(&escape(value)),
                    // Unknown placeholders are left intact; validation
                    // rejects them long before a request gets here.
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
