//! Envelope address helpers
//!
//! Envelope addresses arrive as raw strings (`user@host`, `<user@host>` or the
//! null sender `<>`). Only the pieces the delivery core needs are extracted
//! here; full RFC 5321 parsing belongs to the inbound path.

use crate::Domain;

fn strip_brackets(address: &str) -> &str {
    let address = address.trim();
    address
        .strip_prefix('<')
        .and_then(|a| a.strip_suffix('>'))
        .unwrap_or(address)
}

/// Extract the destination domain of an envelope address
///
/// Returns `None` when the address has no `@` or an empty domain part.
///
/// ```
/// use postern_common::{Domain, domain_of};
///
/// assert_eq!(domain_of("<b@Y.com>"), Some(Domain::new("y.com")));
/// assert_eq!(domain_of("postmaster"), None);
/// ```
#[must_use]
pub fn domain_of(address: &str) -> Option<Domain> {
    let (_, domain) = strip_brackets(address).rsplit_once('@')?;
    let domain = Domain::new(domain);
    (!domain.is_empty()).then_some(domain)
}

/// Whether this is the null reverse-path used by bounces
#[must_use]
pub fn is_null_sender(address: &str) -> bool {
    strip_brackets(address).is_empty()
}

/// Redact the local part of an email address, keeping the domain
#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    if !redact {
        return email.to_string();
    }

    strip_brackets(email).rsplit_once('@').map_or_else(
        || "[REDACTED]".to_string(),
        |(_, domain)| format!("[REDACTED]@{domain}"),
    )
}
