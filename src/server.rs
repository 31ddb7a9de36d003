use crate::{
    ClientStream,
    address::AddrSpec,
    admission::{Admission, AdmissionGate},
    auth::{self, Authenticator},
    commands::{self, CommandContext, UdpRelay, send_reply},
    config::Config,
    dialer::Dialer,
    error::ProtocolError,
    protocol::{ReplyCode, Version},
    request::Request,
    resolver::NameResolver,
    rules::{AddressRewriter, RuleDecision, RuleSet},
};
use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::TcpListener,
};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so persistent errors (EMFILE) don't spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// ServerState is everything a connection task reads. Built once in
/// `Socks5Server::new`, shared read-only by all connections
struct ServerState {
    auth_methods: HashMap<u8, Arc<dyn Authenticator>>,
    resolver: Arc<dyn NameResolver>,
    dialer: Arc<dyn Dialer>,
    rules: Arc<dyn RuleSet>,
    rewriter: Arc<dyn AddressRewriter>,
    udp_relay: Arc<dyn UdpRelay>,
    bind_ip: IpAddr,
    bind_timeout: Option<Duration>,
    gate: AdmissionGate,
}

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server {
    pub listen_addr: String,
    state: Arc<ServerState>,
    listener: Option<TcpListener>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type. `allowed_ips` is the
    /// explicit admission allow-list, on top of the reserved ranges
    pub fn new(
        listen_addr: impl Into<String>,
        config: Config,
        allowed_ips: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        let state = ServerState {
            auth_methods: config.auth_registry(),
            resolver: config.resolver,
            dialer: config.dialer,
            rules: config.rules,
            rewriter: config.rewriter,
            udp_relay: config.udp_relay,
            bind_ip: config.bind_ip,
            bind_timeout: config.bind_timeout,
            gate: AdmissionGate::new(allowed_ips),
        };

        Self {
            listen_addr: listen_addr.into(),
            state: Arc::new(state),
            listener: None,
        }
    }

    /// bind to the listen address. Errors when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("listener for {} is already bound", self.listen_addr);
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.listen_addr))?;
        let addr = listener.local_addr()?;

        info!("SOCKS5 proxy listening on {:?}", addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run binds if needed and accepts connections forever
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("listener for {} is not bound", self.listen_addr))?;

        self.serve(listener).await
    }

    /// serve accepts connections from a listener and spawns one task per
    /// connection. Per-connection failures never stop the loop
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            // Accept incoming connection
            let (inbound, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("failed to accept connection: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let local_addr = match inbound.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    error!("failed to read local address for {peer_addr}: {e}");
                    continue;
                }
            };

            // Clone for this connection
            let state = Arc::clone(&self.state);

            // Spawn async task
            tokio::spawn(async move {
                debug!("new client: {}", peer_addr);

                // Send connection to connection handler
                if let Err(e) = serve_conn(&state, inbound, peer_addr, local_addr).await {
                    error!("socks: {peer_addr}: {e:#}");
                }
            });
        }
    }

    /// serve_conn runs the full pipeline on one already accepted stream
    pub async fn serve_conn<S>(
        &self,
        stream: S,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        serve_conn(&self.state, stream, peer_addr, local_addr).await
    }
}

/// serve_conn handles the full client/server SOCKS5 protocol flow:
/// admission, version, authentication, request, rewrite, rules, command
async fn serve_conn<S>(
    state: &ServerState,
    mut stream: S,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let stream: &mut dyn ClientStream = &mut stream;
    let client_ip = peer_addr.ip().to_canonical();

    // Check client IP before trusting a single byte
    match state.gate.check(client_ip) {
        Admission::Denied => {
            warn!("connection from not allowed IP address: {client_ip}");
            return Ok(());
        }
        origin => info!("connection from {origin} IP address: {client_ip}"),
    }

    // Read the version byte
    let version = stream
        .read_u8()
        .await
        .context("failed to get version byte")?;

    if version != Version::SOCKS5 as u8 {
        return Err(ProtocolError::UnsupportedVersion(version).into());
    }

    // Authenticate the connection
    let auth_context = auth::negotiate(stream, &state.auth_methods)
        .await
        .context("failed to authenticate")?;

    let remote_addr = AddrSpec::from(peer_addr);
    let mut request = match Request::read_from(stream, auth_context, remote_addr).await {
        Ok(request) => request,
        Err(e) => {
            // Only these two failures are answered before closing
            let code = match e {
                ProtocolError::UnrecognizedAddrType(_) => Some(ReplyCode::AddrTypeUnsupported),
                ProtocolError::UnsupportedCommand(_) => Some(ReplyCode::CommandNotSupported),
                _ => None,
            };
            if let Some(code) = code {
                send_reply(stream, code, None)
                    .await
                    .context("failed to send reply")?;
            }
            return Err(e).context("failed to read request");
        }
    };

    // Rewrite first, rules see the final destination
    request.dest_addr = state.rewriter.rewrite(&request);

    let bind_addr = match state.rules.allow(&request) {
        RuleDecision::Permit { bind_addr } => {
            bind_addr.unwrap_or_else(|| SocketAddr::new(state.bind_ip, 0))
        }
        RuleDecision::Deny => {
            warn!(
                "{} to {} from {} not allowed by ruleset",
                request.command, request.dest_addr, request.remote_addr
            );
            send_reply(stream, ReplyCode::ConnectionNotAllowed, None)
                .await
                .context("failed to send reply")?;
            return Ok(());
        }
    };

    debug!(
        "{} {} -> {} (auth method {:#04x})",
        request.command, request.remote_addr, request.dest_addr, request.auth_context.method
    );

    let ctx = CommandContext {
        resolver: state.resolver.as_ref(),
        dialer: state.dialer.as_ref(),
        udp_relay: state.udp_relay.as_ref(),
        bind_addr,
        local_ip: local_addr.ip().to_canonical(),
        bind_timeout: state.bind_timeout,
    };

    commands::execute(stream, &request, &ctx)
        .await
        .with_context(|| format!("failed to handle {} request", request.command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::dialer::Outbound;
    use crate::rules::PermitDestAddrPattern;
    use async_trait::async_trait;
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tokio::io::{AsyncWriteExt, duplex};

    const DOCKER_PEER: &str = "172.17.0.2:40000";
    const LOCAL: &str = "172.17.0.1:1080";

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[tokio::test]
    async fn denied_peer_gets_no_bytes() {
        let server = Socks5Server::new("127.0.0.1:0", Config::default(), []);
        let (mut client, conn) = duplex(64);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        server
            .serve_conn(conn, peer("8.8.8.8:5000"), peer(LOCAL))
            .await
            .unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn allow_listed_peer_is_served() {
        let allowed = [IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))];
        let server = Socks5Server::new("127.0.0.1:0", Config::default(), allowed);
        let (mut client, conn) = duplex(64);

        // Greeting then an unknown address type, which gets a reply
        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x02])
            .await
            .unwrap();

        let result = server
            .serve_conn(conn, peer("8.8.8.8:5000"), peer(LOCAL))
            .await;
        assert!(result.is_err());

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x00, 0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn wrong_version_closes_without_reply() {
        let server = Socks5Server::new("127.0.0.1:0", Config::default(), []);
        let (mut client, conn) = duplex(64);

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let err = server
            .serve_conn(conn, peer(DOCKER_PEER), peer(LOCAL))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::UnsupportedVersion(0x04))
        ));

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_command_replies_code_7() {
        let server = Socks5Server::new("127.0.0.1:0", Config::default(), []);
        let (mut client, conn) = duplex(64);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x09, 0x00, 0x01, 10, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        assert!(
            server
                .serve_conn(conn, peer(DOCKER_PEER), peer(LOCAL))
                .await
                .is_err()
        );

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &[0x05, 0x00]);
        assert_eq!(buf[3], ReplyCode::CommandNotSupported as u8);
    }

    #[tokio::test]
    async fn failed_password_stops_before_request() {
        let config =
            Config::default().with_credentials(StaticCredentials::single("alice", "s3cret"));
        let server = Socks5Server::new("127.0.0.1:0", config, []);
        let (mut client, conn) = duplex(64);

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        client.write_all(&[0x01, 5]).await.unwrap();
        client.write_all(b"alice").await.unwrap();
        client.write_all(&[5]).await.unwrap();
        client.write_all(b"wrong").await.unwrap();

        let err = server
            .serve_conn(conn, peer(DOCKER_PEER), peer(LOCAL))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::AuthFailed)
        ));

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x02, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn ruleset_denial_replies_code_2() {
        let config = Config::default().with_rules(PermitDestAddrPattern::new("*.example.com"));
        let server = Socks5Server::new("127.0.0.1:0", config, []);
        let (mut client, conn) = duplex(64);

        let mut req = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 8];
        req.extend_from_slice(b"evil.org");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        server
            .serve_conn(conn, peer("100.100.3.4:6000"), peer(LOCAL))
            .await
            .unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x00, 0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    /// Sends everything for evil.org to api.example.com instead
    struct RedirectEvil;

    impl AddressRewriter for RedirectEvil {
        fn rewrite(&self, request: &Request) -> AddrSpec {
            match request.dest_addr.fqdn() {
                Some("evil.org") => AddrSpec::domain("api.example.com", request.dest_addr.port),
                _ => request.dest_addr.clone(),
            }
        }
    }

    /// Knows api.example.com only
    struct ApiResolver;

    #[async_trait]
    impl NameResolver for ApiResolver {
        async fn resolve(&self, name: &str) -> io::Result<IpAddr> {
            match name {
                "api.example.com" => Ok(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 80))),
                _ => Err(io::Error::from(io::ErrorKind::NotFound)),
            }
        }
    }

    /// Records dial targets and connects them to a sink that closes at once
    #[derive(Clone, Default)]
    struct RecordingDialer {
        dialed: Arc<Mutex<Vec<SocketAddr>>>,
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn dial(&self, target: SocketAddr) -> io::Result<Outbound> {
            self.dialed.lock().unwrap().push(target);
            let (stream, _remote) = duplex(64);

            Ok(Outbound {
                stream: Box::new(stream),
                local_addr: "192.0.2.1:40000".parse().unwrap(),
            })
        }
    }

    /// Permits everything and pins BIND/UDP sockets to one address
    struct PinnedBind(SocketAddr);

    impl RuleSet for PinnedBind {
        fn allow(&self, _request: &Request) -> RuleDecision {
            RuleDecision::Permit {
                bind_addr: Some(self.0),
            }
        }
    }

    #[tokio::test]
    async fn rewrite_runs_before_rules_and_dial() {
        let dialer = RecordingDialer::default();
        let config = Config::default()
            .with_rewriter(RedirectEvil)
            .with_resolver(ApiResolver)
            .with_dialer(dialer.clone())
            .with_rules(PermitDestAddrPattern::new("*.example.com"));
        let server = Socks5Server::new("127.0.0.1:0", config, []);
        let (mut client, conn) = duplex(256);

        let mut req = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 8];
        req.extend_from_slice(b"evil.org");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let handle = tokio::spawn(async move {
            server
                .serve_conn(conn, peer(DOCKER_PEER), peer(LOCAL))
                .await
        });

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x05, 0x00, 0x00, 0x01, 192, 0, 2, 1, 0x9c, 0x40]);

        drop(client);
        let _ = handle.await.unwrap();
        assert_eq!(*dialer.dialed.lock().unwrap(), [peer("192.0.2.80:443")]);
    }

    #[tokio::test]
    async fn rule_bind_addr_overrides_bind_ip() {
        // Find a free port, then let the rule hand it to BIND
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let pinned = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let config = Config::default().with_rules(PinnedBind(pinned));
        let server = Socks5Server::new("127.0.0.1:0", config, []);
        let (mut client, conn) = duplex(64);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let handle = tokio::spawn(async move {
            server
                .serve_conn(conn, peer(DOCKER_PEER), peer(LOCAL))
                .await
        });

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[0x05, 0x00]);
        assert_eq!(&reply[2..8], &[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([reply[10], reply[11]]), port);

        // Giving up on the peer ends the BIND
        drop(client);
        assert!(handle.await.unwrap().is_err());
    }
}
