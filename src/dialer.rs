use crate::ClientStream;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Outbound is an established CONNECT leg
pub struct Outbound {
    pub stream: Box<dyn ClientStream>,
    /// Local end of the outbound connection, reported as BND.ADDR
    pub local_addr: SocketAddr,
}

/// Dialer opens the outbound connection for CONNECT
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: SocketAddr) -> io::Result<Outbound>;
}

/// TcpDialer connects straight to the target over TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: SocketAddr) -> io::Result<Outbound> {
        let stream = TcpStream::connect(target).await?;
        let local_addr = stream.local_addr()?;

        Ok(Outbound {
            stream: Box::new(stream),
            local_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_dialer_reports_local_addr() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let mut outbound = TcpDialer.dial(target).await.unwrap();
        let (mut accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(outbound.local_addr, peer);

        outbound.stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
