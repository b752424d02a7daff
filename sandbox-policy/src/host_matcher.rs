//! Destination `(host, port)` matching against allow/deny pattern lists.
//!
//! Deny patterns are evaluated before allow patterns; the default on no
//! match is `Deny`. Pattern specificity, from most to least specific:
//! exact > CIDR > wildcard > universal.

use std::net::IpAddr;
use std::net::Ipv4Addr;

/// `Allow` or `Deny` verdict for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Normalizes a raw host string the way a proxy would hand it to the
/// matcher: trims whitespace, strips a `[...]` bracket pair around an IPv6
/// literal, lowercases DNS names (IP literals are left as parsed later).
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(host);
    let host = host.strip_suffix('.').unwrap_or(host);
    host.to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CompiledPattern {
    /// `*`
    Universal,
    /// `10.0.0.0/8`
    Cidr { base: IpAddr, prefix: u8 },
    /// `*.example.com` (excludes the apex `example.com`)
    Wildcard { suffix: String },
    /// `example.com` or `example.com:443`
    Exact {
        host: String,
        port: Option<u16>,
    },
}

impl CompiledPattern {
    fn specificity(&self) -> u8 {
        match self {
            Self::Exact { .. } => 3,
            Self::Cidr { .. } => 2,
            Self::Wildcard { .. } => 1,
            Self::Universal => 0,
        }
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        match self {
            Self::Universal => true,
            Self::Cidr { base, prefix } => match (base, host.parse::<IpAddr>()) {
                (IpAddr::V4(base), Ok(IpAddr::V4(ip))) => ipv4_in_cidr(ip, *base, *prefix),
                (IpAddr::V6(base), Ok(IpAddr::V6(ip))) => ipv6_in_cidr(ip, *base, *prefix),
                _ => false,
            },
            Self::Wildcard { suffix } => {
                host.len() > suffix.len() && host.ends_with(suffix.as_str())
            }
            Self::Exact { host: h, port: p } => {
                host == h && p.is_none_or(|expected| expected == port)
            }
        }
    }
}

fn ipv4_in_cidr(ip: Ipv4Addr, base: Ipv4Addr, prefix: u8) -> bool {
    let ip = u32::from(ip);
    let base = u32::from(base);
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix.min(32))
    };
    (ip & mask) == (base & mask)
}

fn ipv6_in_cidr(ip: std::net::Ipv6Addr, base: std::net::Ipv6Addr, prefix: u8) -> bool {
    let ip = u128::from(ip);
    let base = u128::from(base);
    let mask = if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix.min(128))
    };
    (ip & mask) == (base & mask)
}

/// An error compiling a single host pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid host pattern `{pattern}`: {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

fn compile_pattern(raw: &str) -> Result<CompiledPattern, PatternError> {
    let err = |reason: &str| PatternError {
        pattern: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw == "*" {
        return Ok(CompiledPattern::Universal);
    }

    if let Some((network, prefix)) = raw.split_once('/') {
        let prefix: u8 = prefix.parse().map_err(|_| err("invalid CIDR prefix"))?;
        let base: IpAddr = network.parse().map_err(|_| err("invalid CIDR network"))?;
        let max_prefix = match base {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max_prefix {
            return Err(err("CIDR prefix out of range"));
        }
        return Ok(CompiledPattern::Cidr { base, prefix });
    }

    if let Some(suffix) = raw.strip_prefix("*.") {
        if suffix.is_empty() {
            return Err(err("wildcard suffix is empty"));
        }
        return Ok(CompiledPattern::Wildcard {
            suffix: format!(".{}", normalize_host(suffix)),
        });
    }

    // Bare hostname with an optional `:port`. IPv6 literals contain `:`
    // themselves, so only split on the last `:` when what follows is a
    // plausible port number.
    if let Some((host, port)) = raw.rsplit_once(':')
        && let Ok(port) = port.parse::<u16>()
        && !host.contains(':')
    {
        return Ok(CompiledPattern::Exact {
            host: normalize_host(host),
            port: Some(port),
        });
    }

    Ok(CompiledPattern::Exact {
        host: normalize_host(raw),
        port: None,
    })
}

/// Compiles allow/deny pattern lists once and evaluates `(host, port)`
/// destinations against them repeatedly.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    deny: Vec<CompiledPattern>,
    allow: Vec<CompiledPattern>,
}

impl HostMatcher {
    /// Compiles the allow/deny pattern lists, in the order they were given.
    /// Patterns are never reordered; specificity is resolved at match time.
    pub fn compile(
        allowed: &[String],
        denied: &[String],
    ) -> Result<Self, PatternError> {
        let allow = allowed
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<Result<Vec<_>, _>>()?;
        let deny = denied
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { deny, allow })
    }

    /// Evaluates a destination. Deny patterns are checked first; within a
    /// list, the most specific matching pattern wins, ties broken by
    /// input order.
    pub fn evaluate(&self, host: &str, port: u16) -> Decision {
        let host = normalize_host(host);
        if best_match(&self.deny, &host, port).is_some() {
            return Decision::Deny;
        }
        if best_match(&self.allow, &host, port).is_some() {
            return Decision::Allow;
        }
        Decision::Deny
    }
}

fn best_match<'a>(
    patterns: &'a [CompiledPattern],
    host: &str,
    port: u16,
) -> Option<&'a CompiledPattern> {
    patterns
        .iter()
        .enumerate()
        .filter(|(_, pattern)| pattern.matches(host, port))
        .max_by_key(|(index, pattern)| (pattern.specificity(), std::cmp::Reverse(*index)))
        .map(|(_, pattern)| pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn matcher(allow: &[&str], deny: &[&str]) -> HostMatcher {
        let allow: Vec<String> = allow.iter().map(|s| s.to_string()).collect();
        let deny: Vec<String> = deny.iter().map(|s| s.to_string()).collect();
        HostMatcher::compile(&allow, &deny).expect("patterns compile")
    }

    #[test]
    fn default_is_deny() {
        let m = matcher(&[], &[]);
        assert_eq!(m.evaluate("example.com", 443), Decision::Deny);
    }

    #[test]
    fn exact_match_allows() {
        let m = matcher(&["example.com"], &[]);
        assert_eq!(m.evaluate("example.com", 443), Decision::Allow);
        assert_eq!(m.evaluate("other.com", 443), Decision::Deny);
    }

    #[test]
    fn hostname_case_insensitive() {
        let m = matcher(&["Example.COM"], &[]);
        assert_eq!(m.evaluate("example.com", 443), Decision::Allow);
    }

    #[test]
    fn wildcard_excludes_apex() {
        let m = matcher(&["*.example.com"], &[]);
        assert_eq!(m.evaluate("api.example.com", 443), Decision::Allow);
        assert_eq!(m.evaluate("example.com", 443), Decision::Deny);
    }

    #[test]
    fn bare_host_with_port_requires_port_match() {
        let m = matcher(&["example.com:8080"], &[]);
        assert_eq!(m.evaluate("example.com", 8080), Decision::Allow);
        assert_eq!(m.evaluate("example.com", 443), Decision::Deny);
    }

    #[test]
    fn bare_host_without_port_ignores_port() {
        let m = matcher(&["example.com"], &[]);
        assert_eq!(m.evaluate("example.com", 8080), Decision::Allow);
        assert_eq!(m.evaluate("example.com", 443), Decision::Allow);
    }

    #[test]
    fn cidr_matches_ipv4_range() {
        let m = matcher(&["10.0.0.0/8"], &[]);
        assert_eq!(m.evaluate("10.1.2.3", 443), Decision::Allow);
        assert_eq!(m.evaluate("11.1.2.3", 443), Decision::Deny);
    }

    #[test]
    fn cidr_matches_ipv6_range() {
        let m = matcher(&["2001:db8::/32"], &[]);
        assert_eq!(m.evaluate("2001:db8::1", 443), Decision::Allow);
        assert_eq!(m.evaluate("2001:db9::1", 443), Decision::Deny);
    }

    #[test]
    fn universal_allows_everything_not_denied() {
        let m = matcher(&["*"], &["evil.com"]);
        assert_eq!(m.evaluate("example.com", 443), Decision::Allow);
        assert_eq!(m.evaluate("evil.com", 443), Decision::Deny);
    }

    #[test]
    fn deny_wins_over_allow_when_same_host_listed_in_both() {
        let m = matcher(&["example.com"], &["example.com"]);
        assert_eq!(m.evaluate("example.com", 443), Decision::Deny);
    }

    #[test]
    fn exact_outranks_wildcard_in_deny_list() {
        // Deny the whole subdomain tree, but carve out one exact host via
        // allow; deny is still checked first and wins regardless of the
        // allow list's specificity, since deny patterns are a separate pass.
        let m = matcher(&["safe.example.com"], &["*.example.com"]);
        assert_eq!(m.evaluate("safe.example.com", 443), Decision::Deny);
    }

    #[test]
    fn first_match_wins_among_equal_specificity() {
        let m = matcher(&["example.com:80", "example.com:443"], &[]);
        // Both are Exact-specificity but match disjoint ports, so each only
        // matches its own port; this exercises that compiling two exact
        // patterns for the same host with different ports keeps both.
        assert_eq!(m.evaluate("example.com", 80), Decision::Allow);
        assert_eq!(m.evaluate("example.com", 443), Decision::Allow);
        assert_eq!(m.evaluate("example.com", 22), Decision::Deny);
    }

    #[test]
    fn ipv6_bracket_and_dot_suffix_are_normalized() {
        assert_eq!(normalize_host("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(normalize_host("Example.com."), "example.com");
    }

    #[test]
    fn rejects_cidr_with_out_of_range_prefix() {
        let err = HostMatcher::compile(&["10.0.0.0/40".to_string()], &[])
            .expect_err("prefix out of range");
        assert_eq!(err.pattern, "10.0.0.0/40");
    }
}
