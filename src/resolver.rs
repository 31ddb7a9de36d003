use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use tokio::net::lookup_host;

/// NameResolver turns a domain name from a request into an IP address
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> io::Result<IpAddr>;
}

/// DnsResolver uses the system resolver and takes the first answer
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl NameResolver for DnsResolver {
    async fn resolve(&self, name: &str) -> io::Result<IpAddr> {
        lookup_host((name, 0))
            .await?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no IP address found for '{name}'"),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn resolves_ip_literals_without_dns() {
        let ip = DnsResolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
