//! Per-thread reply addresses: `<slug>-<numeric-id>@<mail-domain>`.
//!
//! Outbound thread and event mail is sent from this address so that replies
//! land on the inbound webhook, which parses the numeric ID back out.

use crate::constants::SLUG_MAX_LEN;

/// Lowercase, ASCII-alphanumeric slug with single dashes, at most
/// [`SLUG_MAX_LEN`] characters.
pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    let mut dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if dash && !slug.is_empty() {
                slug.push('-');
            }
            dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            dash = true;
        }
        if slug.len() >= SLUG_MAX_LEN {
            break;
        }
    }
    slug.truncate(SLUG_MAX_LEN);
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "convo".to_string()
    } else {
        slug
    }
}

pub fn reply_address(name: &str, id: i64, mail_domain: &str) -> String {
    format!("{}-{}@{}", slugify(name), id, mail_domain)
}

/// Extract the numeric ID from a reply address. Accepts a bare address or a
/// `Display Name <address>` form.
pub fn parse_reply_address(address: &str) -> Option<i64> {
    let address = address.trim();
    let address = match (address.rfind('<'), address.rfind('>')) {
        (Some(start), Some(end)) if start < end => &address[start + 1..end],
        _ => address,
    };
    let (local, _domain) = address.split_once('@')?;
    let (_, id) = local.rsplit_once('-').unwrap_or(("", local));
    id.parse().ok().filter(|id: &i64| *id > 0)
}

/// Bare e-mail address out of an RFC 5322 `From` value.
pub fn bare_address(from: &str) -> String {
    let from = from.trim();
    match (from.rfind('<'), from.rfind('>')) {
        (Some(start), Some(end)) if start < end => from[start + 1..end].trim().to_lowercase(),
        _ => from.to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hi there!"), "hi-there");
        assert_eq!(slugify("  Dinner @ Joe's  "), "dinner-joe-s");
        assert_eq!(slugify("!!!"), "convo");
        assert!(slugify("A very long subject line that goes on").len() <= SLUG_MAX_LEN);
    }

    #[test]
    fn test_reply_address_roundtrip() {
        let addr = reply_address("Hi", 5066549580791808, "mail.host");
        assert_eq!(addr, "hi-5066549580791808@mail.host");
        assert_eq!(parse_reply_address(&addr), Some(5066549580791808));
        assert_eq!(
            parse_reply_address("Convo <hi-12@mail.host>"),
            Some(12)
        );
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        assert_eq!(parse_reply_address("hello@mail.host"), None);
        assert_eq!(parse_reply_address("no-at-sign"), None);
    }

    #[test]
    fn test_bare_address() {
        assert_eq!(bare_address("Alice <Alice@X.com>"), "alice@x.com");
        assert_eq!(bare_address(" bob@x.com "), "bob@x.com");
    }
}
