use crate::auth::{Authenticator, CredentialStore, NoAuthAuthenticator, UserPassAuthenticator};
use crate::commands::{DiscardRelay, UdpRelay};
use crate::dialer::{Dialer, TcpDialer};
use crate::resolver::{DnsResolver, NameResolver};
use crate::rules::{AddressRewriter, NoRewrite, PermitAll, RuleSet};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

/// Config bundles every pluggable strategy of the server. It is read-only
/// once handed to `Socks5Server::new`
#[derive(Clone)]
pub struct Config {
    /// Explicit authentication methods. When empty, username/password is
    /// used if `credentials` is set, otherwise no-auth
    pub auth_methods: Vec<Arc<dyn Authenticator>>,

    pub credentials: Option<Arc<dyn CredentialStore>>,

    pub resolver: Arc<dyn NameResolver>,

    /// Opens outbound connections for CONNECT
    pub dialer: Arc<dyn Dialer>,

    pub rules: Arc<dyn RuleSet>,

    /// Runs before `rules`
    pub rewriter: Arc<dyn AddressRewriter>,

    pub udp_relay: Arc<dyn UdpRelay>,

    /// Local IP for BIND listeners and UDP associations
    pub bind_ip: IpAddr,

    /// Upper bound on BIND's wait for the inbound connection. None waits
    /// until the client gives up
    pub bind_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_methods: Vec::new(),
            credentials: None,
            resolver: Arc::new(DnsResolver),
            dialer: Arc::new(TcpDialer),
            rules: Arc::new(PermitAll),
            rewriter: Arc::new(NoRewrite),
            udp_relay: Arc::new(DiscardRelay),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_timeout: None,
        }
    }
}

impl Config {
    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.auth_methods.push(Arc::new(authenticator));
        self
    }

    pub fn with_credentials(mut self, credentials: impl CredentialStore + 'static) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    pub fn with_resolver(mut self, resolver: impl NameResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }

    pub fn with_rules(mut self, rules: impl RuleSet + 'static) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    pub fn with_rewriter(mut self, rewriter: impl AddressRewriter + 'static) -> Self {
        self.rewriter = Arc::new(rewriter);
        self
    }

    pub fn with_udp_relay(mut self, relay: impl UdpRelay + 'static) -> Self {
        self.udp_relay = Arc::new(relay);
        self
    }

    pub fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }

    pub fn with_bind_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.bind_timeout = timeout;
        self
    }

    /// auth_registry builds the METHOD byte -> authenticator table.
    /// It is never empty
    pub(crate) fn auth_registry(&self) -> HashMap<u8, Arc<dyn Authenticator>> {
        let methods: Vec<Arc<dyn Authenticator>> = if !self.auth_methods.is_empty() {
            self.auth_methods.clone()
        } else if let Some(credentials) = &self.credentials {
            let userpass: Arc<dyn Authenticator> =
                Arc::new(UserPassAuthenticator::new(Arc::clone(credentials)));
            vec![userpass]
        } else {
            vec![Arc::new(NoAuthAuthenticator) as Arc<dyn Authenticator>]
        };

        methods.into_iter().map(|a| (a.code(), a)).collect()
    }
}
