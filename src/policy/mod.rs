//! Domain-name policy: decides which names may ever be signed.
//!
//! Pure validation, no state, no I/O; safe to call from any thread. The
//! rules keep the authority strictly local: only development suffixes
//! are signable, and anything that collides with a public IANA TLD is
//! rejected outright.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::OnceLock;

use crate::error::PolicyError;

/// Right-most labels that the authority will sign for.
const ALLOWED_TLDS: &[&str] = &["localhost", "test", "localdev", "internal"];

/// Special-cased two-label suffix (RFC 8375 home networks).
const ALLOWED_SUFFIX: &str = "home.arpa";

/// IANA TLD snapshot, compiled in; there is no runtime fetch.
const IANA_TLD_SNAPSHOT: &str = include_str!("tlds_alpha_by_domain.txt");

fn public_tlds() -> &'static HashSet<String> {
    static TLDS: OnceLock<HashSet<String>> = OnceLock::new();
    TLDS.get_or_init(|| {
        IANA_TLD_SNAPSHOT
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_ascii_lowercase)
            .collect()
    })
}

/// True when `suffix` appears in the embedded IANA TLD snapshot.
pub fn is_public_tld(suffix: &str) -> bool {
    public_tlds().contains(&suffix.to_ascii_lowercase())
}

/// Lowercase and strip a single trailing root dot.
pub fn normalize(name: &str) -> String {
    let lowered = name.trim().to_ascii_lowercase();
    lowered.strip_suffix('.').unwrap_or(&lowered).to_string()
}

/// Validate a single DNS name or wildcard pattern against the policy.
///
/// Rules are evaluated in order: DNS syntax, wildcard position, wildcard
/// depth, TLD allowlist, IANA blocklist. The input is normalized first;
/// callers that persist the name should persist [`normalize`]'s output.
pub fn validate_dns(name: &str) -> Result<(), PolicyError> {
    let name = normalize(name);
    if name.is_empty() {
        return Err(PolicyError::InvalidName("empty name".into()));
    }

    // Wildcards: at most one `*`, and only as the whole left-most label.
    let base = if let Some(rest) = name.strip_prefix("*.") {
        if rest.contains('*') {
            return Err(PolicyError::WildcardPosition);
        }
        rest
    } else if name.contains('*') {
        return Err(PolicyError::WildcardPosition);
    } else {
        name.as_str()
    };

    check_dns_syntax(base)?;

    let labels: Vec<&str> = base.split('.').collect();
    if name.starts_with("*.") && labels.len() < 2 {
        return Err(PolicyError::WildcardTooShallow);
    }

    // The effective suffix must be one of the development allowlist
    // entries; `home.arpa` is matched as a whole two-label suffix.
    let last = *labels.last().expect("non-empty name has a last label");
    let suffix = if base == ALLOWED_SUFFIX || base.ends_with(&format!(".{ALLOWED_SUFFIX}")) {
        ALLOWED_SUFFIX
    } else if ALLOWED_TLDS.contains(&last) {
        last
    } else {
        return Err(PolicyError::TldNotAllowed);
    };

    // Defense in depth: even an allowlisted suffix must not collide with
    // a delegated public TLD.
    if is_public_tld(suffix) {
        return Err(PolicyError::TldPublic);
    }

    Ok(())
}

/// Validate an IP SAN: only loopback and RFC1918/ULA ranges.
pub fn validate_ip(addr: &IpAddr) -> Result<(), PolicyError> {
    let ok = match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    };
    if ok {
        Ok(())
    } else {
        Err(PolicyError::IpNotLocal(*addr))
    }
}

/// LDH syntax: 253 octets total, labels of 1..=63 letter/digit/hyphen
/// characters with no leading or trailing hyphen.
fn check_dns_syntax(name: &str) -> Result<(), PolicyError> {
    if name.is_empty() || name.len() > 253 {
        return Err(PolicyError::InvalidName(name.to_string()));
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(PolicyError::InvalidName(name.to_string()));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(PolicyError::InvalidName(name.to_string()));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(PolicyError::InvalidName(name.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_allowlisted_names() {
        for name in [
            "localhost",
            "myapp.localhost",
            "a.b.myapp.localhost",
            "myapp.test",
            "api.localdev",
            "svc.internal",
            "nas.home.arpa",
            "home.arpa",
        ] {
            assert_eq!(validate_dns(name), Ok(()), "{name}");
        }
    }

    #[test]
    fn test_normalizes_case_and_root_dot() {
        assert_eq!(validate_dns("MyApp.LOCALHOST."), Ok(()));
        assert_eq!(normalize("MyApp.LOCALHOST."), "myapp.localhost");
    }

    #[test]
    fn test_rejects_public_and_unknown_tlds() {
        assert_eq!(validate_dns("evil.com"), Err(PolicyError::TldNotAllowed));
        assert_eq!(validate_dns("myapp.dev"), Err(PolicyError::TldNotAllowed));
        assert_eq!(validate_dns("myapp.lan"), Err(PolicyError::TldNotAllowed));
    }

    #[test]
    fn test_wildcard_rules() {
        assert_eq!(validate_dns("*.app.localhost"), Ok(()));
        assert_eq!(validate_dns("*.a.b.localhost"), Ok(()));
        assert_eq!(
            validate_dns("*.localhost"),
            Err(PolicyError::WildcardTooShallow)
        );
        assert_eq!(
            validate_dns("app.*.localhost"),
            Err(PolicyError::WildcardPosition)
        );
        assert_eq!(
            validate_dns("*.*.localhost"),
            Err(PolicyError::WildcardPosition)
        );
        assert_eq!(
            validate_dns("f*o.localhost"),
            Err(PolicyError::WildcardPosition)
        );
        assert_eq!(validate_dns("*"), Err(PolicyError::WildcardPosition));
    }

    #[test]
    fn test_rejects_bad_syntax() {
        for name in [
            "",
            ".",
            "a..localhost",
            "-app.localhost",
            "app-.localhost",
            "my_app.localhost",
            "app..",
        ] {
            assert!(
                matches!(validate_dns(name), Err(PolicyError::InvalidName(_))),
                "{name:?}"
            );
        }
    }

    #[test]
    fn test_rejects_overlong_names() {
        let label = "a".repeat(64);
        assert!(matches!(
            validate_dns(&format!("{label}.localhost")),
            Err(PolicyError::InvalidName(_))
        ));

        let long = format!("{}.localhost", "abcdef.".repeat(40));
        assert!(matches!(
            validate_dns(&long),
            Err(PolicyError::InvalidName(_))
        ));
    }

    #[test]
    fn test_public_tld_snapshot_lookup() {
        assert!(is_public_tld("com"));
        assert!(is_public_tld("DEV"));
        assert!(is_public_tld("arpa"));
        assert!(!is_public_tld("localhost"));
        assert!(!is_public_tld("test"));
        assert!(!is_public_tld("internal"));
        assert!(!is_public_tld("home.arpa"));
    }

    #[test]
    fn test_home_arpa_not_shadowed_by_arpa_tld() {
        // `arpa` itself is delegated, but the allowlist entry is the full
        // two-label suffix, which is not.
        assert_eq!(validate_dns("printer.home.arpa"), Ok(()));
        assert_eq!(validate_dns("x.arpa"), Err(PolicyError::TldNotAllowed));
    }

    #[test]
    fn test_ip_policy() {
        for good in ["127.0.0.1", "127.8.9.10", "10.0.0.5", "172.16.1.1", "192.168.1.20", "::1", "fd12:3456::1"] {
            let addr: IpAddr = good.parse().unwrap();
            assert_eq!(validate_ip(&addr), Ok(()), "{good}");
        }
        for bad in ["8.8.8.8", "1.1.1.1", "172.32.0.1", "2001:4860::1", "fe80::1"] {
            let addr: IpAddr = bad.parse().unwrap();
            assert!(
                matches!(validate_ip(&addr), Err(PolicyError::IpNotLocal(_))),
                "{bad}"
            );
        }
    }
}
