use crate::error::ProtocolError;
use crate::protocol::AddressType;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Host is the address part of an address specification:
/// IPv4, IPv6, or a domain name still to be resolved
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

/// AddrSpec is a SOCKS5 address specification (ATYP, ADDR, PORT).
/// It is used for request destinations, bound addresses in replies and
/// the observed remote address of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddrSpec {
    pub host: Host,
    pub port: u16,
}

impl AddrSpec {
    /// new is a constructor for the AddrSpec type
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    /// domain builds an unresolved domain name specification
    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self::new(Host::Domain(name.into()), port)
    }

    /// unspecified is the all-zero IPv4 address used in error replies
    pub fn unspecified() -> Self {
        Self::new(Host::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    /// address_type returns the ATYP byte that tags this specification
    pub fn address_type(&self) -> AddressType {
        match self.host {
            Host::V4(_) => AddressType::IPv4,
            Host::V6(_) => AddressType::IPv6,
            Host::Domain(_) => AddressType::DomainName,
        }
    }

    /// fqdn returns the domain name, if this specification carries one
    pub fn fqdn(&self) -> Option<&str> {
        match &self.host {
            Host::Domain(name) => Some(name),
            _ => None,
        }
    }

    /// socket_addr returns the dialable address for IP specifications.
    /// Domain names must go through a resolver first
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.host {
            Host::V4(ip) => Some(SocketAddr::new(IpAddr::V4(ip), self.port)),
            Host::V6(ip) => Some(SocketAddr::new(IpAddr::V6(ip), self.port)),
            Host::Domain(_) => None,
        }
    }

    /// read_from decodes ATYP, DST.ADDR and DST.PORT from a stream
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        // +------+----------+----------+
        // | ATYP | DST.ADDR | DST.PORT |
        // +------+----------+----------+
        // |  1   | Variable |    2     |
        // +------+----------+----------+
        let atyp = reader.read_u8().await?;

        let host = match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                let mut addr = [0u8; 4];
                reader.read_exact(&mut addr).await?;
                Host::V4(Ipv4Addr::from(addr))
            }
            Some(AddressType::DomainName) => {
                // First octet in DomainName contains the number of
                // octets to follow
                let len = reader.read_u8().await?;
                let mut domain = vec![0u8; len as usize];
                reader.read_exact(&mut domain).await?;

                if domain.is_empty() {
                    return Err(ProtocolError::InvalidDomain("empty name".into()));
                }

                let name = String::from_utf8(domain)
                    .map_err(|e| ProtocolError::InvalidDomain(e.to_string()))?;
                Host::Domain(name)
            }
            Some(AddressType::IPv6) => {
                let mut addr = [0u8; 16];
                reader.read_exact(&mut addr).await?;
                Host::V6(Ipv6Addr::from(addr))
            }
            None => return Err(ProtocolError::UnrecognizedAddrType(atyp)),
        };

        // Port is big endian (network order)
        let port = reader.read_u16().await?;

        Ok(Self { host, port })
    }

    /// encode appends the wire form of this specification to buf
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buf.push(self.address_type() as u8);

        match &self.host {
            Host::V4(ip) => buf.extend_from_slice(&ip.octets()),
            Host::V6(ip) => buf.extend_from_slice(&ip.octets()),
            Host::Domain(name) => {
                let len = u8::try_from(name.len())
                    .map_err(|_| ProtocolError::InvalidDomain(format!("{name} is too long")))?;
                if len == 0 {
                    return Err(ProtocolError::InvalidDomain("empty name".into()));
                }
                buf.push(len);
                buf.extend_from_slice(name.as_bytes());
            }
        }

        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(())
    }

    /// write_to encodes and writes this specification to a stream
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = Vec::with_capacity(22);
        self.encode(&mut buf)?;
        writer.write_all(&buf).await?;
        Ok(())
    }
}

impl From<SocketAddr> for AddrSpec {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr.ip().to_canonical() {
            IpAddr::V4(ip) => Host::V4(ip),
            IpAddr::V6(ip) => Host::V6(ip),
        };
        Self::new(host, addr.port())
    }
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::V4(ip) => write!(f, "{ip}:{}", self.port),
            Host::V6(ip) => write!(f, "[{ip}]:{}", self.port),
            Host::Domain(name) => write!(f, "{name}:{}", self.port),
        }
    }
}
