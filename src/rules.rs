use crate::address::AddrSpec;
use crate::protocol::Command;
use crate::request::Request;
use std::net::SocketAddr;

/// RuleDecision is the outcome of evaluating a request against a RuleSet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDecision {
    /// Request may proceed. BIND and UDP ASSOCIATE use `bind_addr`, when
    /// set, instead of the server's configured bind IP
    Permit { bind_addr: Option<SocketAddr> },
    Deny,
}

impl RuleDecision {
    /// permit allows the request with the default bind address
    pub fn permit() -> Self {
        RuleDecision::Permit { bind_addr: None }
    }

    pub fn is_permitted(&self) -> bool {
        matches!(self, RuleDecision::Permit { .. })
    }
}

impl From<bool> for RuleDecision {
    fn from(allowed: bool) -> Self {
        if allowed {
            RuleDecision::permit()
        } else {
            RuleDecision::Deny
        }
    }
}

/// RuleSet decides whether an authenticated request may be served
pub trait RuleSet: Send + Sync {
    fn allow(&self, request: &Request) -> RuleDecision;
}

/// PermitAll allows every request
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAll;

impl RuleSet for PermitAll {
    fn allow(&self, _request: &Request) -> RuleDecision {
        RuleDecision::permit()
    }
}

/// PermitCommand toggles each SOCKS5 command on or off
#[derive(Debug, Clone, Copy)]
pub struct PermitCommand {
    pub enable_connect: bool,
    pub enable_bind: bool,
    pub enable_associate: bool,
}

impl Default for PermitCommand {
    fn default() -> Self {
        Self {
            enable_connect: true,
            enable_bind: true,
            enable_associate: true,
        }
    }
}

impl RuleSet for PermitCommand {
    fn allow(&self, request: &Request) -> RuleDecision {
        let enabled = match request.command {
            Command::Connect => self.enable_connect,
            Command::Bind => self.enable_bind,
            Command::UdpAssociate => self.enable_associate,
        };
        enabled.into()
    }
}

/// PermitDestAddrPattern only lets requests through whose destination
/// host name matches a wildcard pattern such as `*.example.com`.
///
/// `*` matches any run of characters (including dots and the empty
/// string); everything else matches literally and case-insensitively.
/// Destinations given as IP literals never match.
#[derive(Debug, Clone)]
pub struct PermitDestAddrPattern {
    pattern: String,
}

impl PermitDestAddrPattern {
    pub fn new(pattern: impl AsRef<str>) -> Self {
        Self {
            pattern: normalize_host(pattern.as_ref()),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// matches tests a host name against the pattern
    pub fn matches(&self, host: &str) -> bool {
        wildcard_match(self.pattern.as_bytes(), normalize_host(host).as_bytes())
    }
}

impl RuleSet for PermitDestAddrPattern {
    fn allow(&self, request: &Request) -> RuleDecision {
        request
            .dest_addr
            .fqdn()
            .is_some_and(|host| self.matches(host))
            .into()
    }
}

/// Host names compare lowercase and without the root label dot
fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// wildcard_match is a glob match supporting `*` only
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Position of the last `*` seen and the text index it was tried at
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            // Let the last `*` swallow one more character
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// AddressRewriter may transparently replace a request's destination.
/// It runs before the RuleSet
pub trait AddressRewriter: Send + Sync {
    fn rewrite(&self, request: &Request) -> AddrSpec;
}

/// NoRewrite keeps every destination as requested
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRewrite;

impl AddressRewriter for NoRewrite {
    fn rewrite(&self, request: &Request) -> AddrSpec {
        request.dest_addr.clone()
    }
}
