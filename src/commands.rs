use crate::ClientStream;
use crate::address::AddrSpec;
use crate::dialer::Dialer;
use crate::error::ProtocolError;
use crate::protocol::{Command, RSV, ReplyCode, Version};
use crate::request::Request;
use crate::resolver::NameResolver;
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, copy_bidirectional},
    net::{TcpListener, TcpStream, UdpSocket},
    select,
};
use tracing::{debug, info};

/// Largest UDP payload we read in one go
pub const MAX_DGRAM: usize = 65_535;

/// Client bytes buffered while BIND waits for its peer. Past this the
/// client is left to TCP backpressure
const MAX_EARLY_DATA: usize = 64 * 1024;

/// UdpAssociation is an established UDP ASSOCIATE: a socket bound on the
/// server and the addresses it was negotiated with. It lives exactly as
/// long as the client's control connection
#[derive(Debug)]
pub struct UdpAssociation {
    pub socket: UdpSocket,
    /// Address advertised to the client in the reply
    pub advertised_addr: AddrSpec,
    /// Peer of the control connection
    pub client_addr: AddrSpec,
    /// DST.ADDR from the request, where the client said it will send from
    pub requested_addr: AddrSpec,
}

/// UdpRelay moves datagrams for an association. The relay future is
/// dropped when the control connection closes
#[async_trait]
pub trait UdpRelay: Send + Sync {
    async fn relay(&self, association: UdpAssociation) -> io::Result<()>;
}

/// DiscardRelay keeps the association open and drops whatever arrives
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardRelay;

#[async_trait]
impl UdpRelay for DiscardRelay {
    async fn relay(&self, association: UdpAssociation) -> io::Result<()> {
        let mut buffer = vec![0u8; MAX_DGRAM];

        loop {
            let (len, from) = association.socket.recv_from(&mut buffer).await?;
            debug!(
                "discarding {len} byte datagram from {from} on {}",
                association.advertised_addr
            );
        }
    }
}

/// Settings the command handlers need from the server configuration
pub struct CommandContext<'a> {
    pub resolver: &'a dyn NameResolver,
    pub dialer: &'a dyn Dialer,
    pub udp_relay: &'a dyn UdpRelay,
    /// Where BIND and UDP ASSOCIATE sockets get bound
    pub bind_addr: SocketAddr,
    /// Local IP of the control connection, advertised instead of an
    /// unspecified bind IP
    pub local_ip: IpAddr,
    pub bind_timeout: Option<Duration>,
}

/// execute runs a permitted request to completion
pub async fn execute(
    stream: &mut dyn ClientStream,
    request: &Request,
    ctx: &CommandContext<'_>,
) -> Result<()> {
    match request.command {
        Command::Connect => handle_connect(stream, request, ctx).await,
        Command::Bind => handle_bind(stream, request, ctx).await,
        Command::UdpAssociate => handle_associate(stream, request, ctx).await,
    }
}

// ================
// CONNECT COMMAND
// ================

/// handle_connect dials the destination, reports the outcome and relays
async fn handle_connect(
    stream: &mut dyn ClientStream,
    request: &Request,
    ctx: &CommandContext<'_>,
) -> Result<()> {
    let target = match resolve(&request.dest_addr, ctx.resolver).await {
        Ok(target) => target,
        Err(e) => {
            send_reply(stream, ReplyCode::HostUnreachable, None).await?;
            bail!("failed to resolve {}: {e}", request.dest_addr);
        }
    };

    // Connect to target
    let mut outbound = match ctx.dialer.dial(target).await {
        Ok(outbound) => outbound,
        Err(e) => {
            send_reply(stream, ReplyCode::from_io_error(&e), None).await?;
            bail!("connect to {} ({target}) failed: {e}", request.dest_addr);
        }
    };

    let bound = AddrSpec::from(outbound.local_addr);
    send_reply(stream, ReplyCode::Succeeded, Some(&bound)).await?;

    info!("CONNECT {} -> {}", request.remote_addr, request.dest_addr);

    relay(stream, outbound.stream.as_mut()).await
}

/// resolve turns a destination into a dialable socket address
async fn resolve(dest: &AddrSpec, resolver: &dyn NameResolver) -> io::Result<SocketAddr> {
    match (dest.socket_addr(), dest.fqdn()) {
        (Some(addr), _) => Ok(addr),
        (None, Some(name)) => {
            let ip = resolver.resolve(name).await?;
            Ok(SocketAddr::new(ip, dest.port))
        }
        (None, None) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "destination has neither IP nor name",
        )),
    }
}

// =============
// BIND COMMAND
// =============

/// handle_bind listens for one inbound connection on behalf of the client.
/// Two replies are sent: the listening address, then the accepted peer
async fn handle_bind(
    stream: &mut dyn ClientStream,
    request: &Request,
    ctx: &CommandContext<'_>,
) -> Result<()> {
    let listener = match TcpListener::bind(ctx.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            send_reply(stream, ReplyCode::from_io_error(&e), None).await?;
            bail!("BIND listener on {} failed: {e}", ctx.bind_addr);
        }
    };

    let bound = advertised(listener.local_addr()?, ctx.local_ip);
    send_reply(stream, ReplyCode::Succeeded, Some(&bound)).await?;

    info!(
        "BIND {} listening on {bound} (expecting {})",
        request.remote_addr, request.dest_addr
    );

    // The control connection is the relay, so client bytes sent before the
    // peer shows up are kept and forwarded once it does
    let mut early = Vec::new();
    let mut buf = [0u8; 4096];
    let accept = accept_within(&listener, ctx.bind_timeout);
    tokio::pin!(accept);

    let accepted = loop {
        select! {
            accepted = &mut accept => break accepted,
            read = stream.read(&mut buf), if early.len() < MAX_EARLY_DATA => match read {
                Ok(0) | Err(_) => {
                    bail!("client closed the control connection while BIND was waiting");
                }
                Ok(n) => early.extend_from_slice(&buf[..n]),
            },
        }
    };

    let (mut inbound, peer) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            let code = if e.kind() == io::ErrorKind::TimedOut {
                ReplyCode::TtlExpired
            } else {
                ReplyCode::ServerFailure
            };
            send_reply(stream, code, None).await?;
            bail!("BIND accept on {bound} failed: {e}");
        }
    };

    send_reply(stream, ReplyCode::Succeeded, Some(&AddrSpec::from(peer))).await?;
    info!("BIND {bound} accepted {peer}");

    if !early.is_empty() {
        debug!("BIND forwarding {} bytes sent before {peer} connected", early.len());
        inbound.write_all(&early).await?;
    }

    relay(stream, &mut inbound).await
}

/// accept_within accepts one connection, optionally bounded in time
async fn accept_within(
    listener: &TcpListener,
    limit: Option<Duration>,
) -> io::Result<(TcpStream, SocketAddr)> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, listener.accept())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no inbound connection"))?,
        None => listener.accept().await,
    }
}

// ===============
// UDP ASSOCIATE
// ===============

/// handle_associate binds the relay socket, advertises it and keeps the
/// association alive until the control connection goes away
async fn handle_associate(
    stream: &mut dyn ClientStream,
    request: &Request,
    ctx: &CommandContext<'_>,
) -> Result<()> {
    let socket = match UdpSocket::bind(ctx.bind_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            // If there's an issue, it's with binding the UDP socket server side
            send_reply(stream, ReplyCode::from_io_error(&e), None).await?;
            bail!("UDP ASSOCIATE bind on {} failed: {e}", ctx.bind_addr);
        }
    };

    let advertised_addr = advertised(socket.local_addr()?, ctx.local_ip);
    send_reply(stream, ReplyCode::Succeeded, Some(&advertised_addr)).await?;

    info!(
        "UDP ASSOCIATE {} relaying on {advertised_addr}",
        request.remote_addr
    );

    let association = UdpAssociation {
        socket,
        advertised_addr: advertised_addr.clone(),
        client_addr: request.remote_addr.clone(),
        requested_addr: request.dest_addr.clone(),
    };

    select! {
        relayed = ctx.udp_relay.relay(association) => {
            relayed.map_err(|e| anyhow!("UDP relay on {advertised_addr} failed: {e}"))?;
        }
        _ = wait_for_close(stream) => {
            info!("client closed: terminating UDP association {advertised_addr}");
        }
    }

    Ok(())
}

// =========
// HELPERS
// =========

/// relay copies bytes both ways until both sides are done. EOF on one
/// side shuts down the write half of the other
async fn relay(stream: &mut dyn ClientStream, outbound: &mut dyn ClientStream) -> Result<()> {
    let (from_client, from_server) = copy_bidirectional(stream, outbound).await?;

    info!(
        "connection closed: {} bytes from client, {} bytes from server",
        from_client, from_server
    );

    Ok(())
}

/// wait_for_close resolves once the control connection of a UDP association
/// hits EOF or errors. The client sends nothing on it, stray bytes are dropped
async fn wait_for_close(stream: &mut dyn ClientStream) {
    let mut buf = [0u8; 64];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => debug!("ignoring {n} unexpected bytes on control connection"),
        }
    }
}

/// advertised replaces an unspecified bind IP with the IP the client
/// actually reached us on
fn advertised(bound: SocketAddr, local_ip: IpAddr) -> AddrSpec {
    if bound.ip().is_unspecified() {
        AddrSpec::from(SocketAddr::new(local_ip, bound.port()))
    } else {
        AddrSpec::from(bound)
    }
}

/// encode_reply builds a reply frame; a missing address is sent as
/// 0.0.0.0:0
pub fn encode_reply(
    reply_code: ReplyCode,
    bound_addr: Option<&AddrSpec>,
) -> Result<Vec<u8>, ProtocolError> {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut reply = vec![Version::SOCKS5 as u8, reply_code as u8, RSV];

    match bound_addr {
        Some(addr) => addr.encode(&mut reply)?,
        None => AddrSpec::unspecified().encode(&mut reply)?,
    }

    Ok(reply)
}

/// send_reply handles logic for sending replies from the SOCKS server to
/// the client
pub async fn send_reply<W>(
    stream: &mut W,
    reply_code: ReplyCode,
    bound_addr: Option<&AddrSpec>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let reply = encode_reply(reply_code, bound_addr)?;
    stream.write_all(&reply).await?;
    Ok(())
}
