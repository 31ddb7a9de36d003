use crate::ClientStream;
use crate::address::AddrSpec;
use crate::auth::AuthContext;
use crate::error::ProtocolError;
use crate::protocol::{Command, Version};
use tokio::io::AsyncReadExt;

/// Request is a decoded SOCKS5 request, stamped with how the client
/// authenticated and where it connected from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    /// Destination as requested, or as replaced by the AddressRewriter
    pub dest_addr: AddrSpec,
    pub auth_context: AuthContext,
    /// Peer address observed on the transport, never client supplied
    pub remote_addr: AddrSpec,
}

impl Request {
    /// read_from decodes a request from a stream whose authentication
    /// sub-negotiation has completed
    pub async fn read_from(
        stream: &mut dyn ClientStream,
        auth_context: AuthContext,
        remote_addr: AddrSpec,
    ) -> Result<Self, ProtocolError> {
        // SOCKS5 request format
        // +----+-----+-------+------+----------+----------+
        // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
        // +----+-----+-------+------+----------+----------+
        // | 1  |  1  | X'00' |  1   | Variable |    2     |
        // +----+-----+-------+------+----------+----------+
        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await?;

        // RSV is ignored
        let (version, command) = (header[0], header[1]);

        if version != Version::SOCKS5 as u8 {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        // Address is read even for unknown commands, the reply follows it
        let dest_addr = AddrSpec::read_from(stream).await?;

        let command =
            Command::from_byte(command).ok_or(ProtocolError::UnsupportedCommand(command))?;

        Ok(Self {
            command,
            dest_addr,
            auth_context,
            remote_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Host;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncWriteExt, duplex};

    fn remote() -> AddrSpec {
        AddrSpec::new(Host::V4(Ipv4Addr::new(100, 64, 0, 7)), 41000)
    }

    async fn decode(bytes: &[u8]) -> Result<Request, ProtocolError> {
        let (mut client, mut server) = duplex(512);
        client.write_all(bytes).await.unwrap();
        drop(client);
        Request::read_from(&mut server, AuthContext::default(), remote()).await
    }

    #[tokio::test]
    async fn decodes_connect_to_ipv4() {
        let req = decode(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.dest_addr.to_string(), "10.0.0.1:80");
        assert_eq!(req.remote_addr, remote());
    }

    #[tokio::test]
    async fn decodes_bind_to_domain() {
        let mut bytes = vec![0x05, 0x02, 0x00, 0x03, 7];
        bytes.extend_from_slice(b"foo.bar");
        bytes.extend_from_slice(&21u16.to_be_bytes());

        let req = decode(&bytes).await.unwrap();
        assert_eq!(req.command, Command::Bind);
        assert_eq!(req.dest_addr, AddrSpec::domain("foo.bar", 21));
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        let err = decode(&[0x04, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion(0x04)));
    }

    #[tokio::test]
    async fn reports_unrecognized_address_type() {
        let err = decode(&[0x05, 0x01, 0x00, 0x02, 10, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnrecognizedAddrType(0x02)));
    }

    #[tokio::test]
    async fn reports_unknown_command_after_reading_address() {
        let err = decode(&[0x05, 0x09, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedCommand(0x09)));
    }
}
