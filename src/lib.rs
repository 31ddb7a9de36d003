//! A SOCKS5 proxy server library with a pre-authentication IP gate
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT, BIND and UDP ASSOCIATE
//!     - No Authentication
//!     - Username/Password Authentication
//!     - Pluggable authenticators, name resolver, dialer, rule set and address rewriter
//!     - Admission gate: container (172.16.0.0/12) and mesh VPN (100.64.0.0/10)
//!       ranges plus an explicit IP allow-list, checked before any protocol byte
//!     - Async using tokio, one task per connection
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socksgate::{Config, Socks5Server, auth::StaticCredentials, rules::PermitDestAddrPattern};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default()
//!         .with_credentials(StaticCredentials::single("alice", "s3cret"))
//!         .with_rules(PermitDestAddrPattern::new("*.example.com"));
//!
//!     let allowed: [std::net::IpAddr; 1] = ["203.0.113.7".parse()?];
//!     let mut server = Socks5Server::new("0.0.0.0:1080", config, allowed);
//!     server.run().await
//! }
//! ```

pub mod address;
pub mod admission;
pub mod auth;
pub mod commands;
pub mod config;
pub mod dialer;
pub mod error;
pub mod protocol;
pub mod request;
pub mod resolver;
pub mod rules;
pub mod server;

use tokio::io::{AsyncRead, AsyncWrite};

/// ClientStream is any byte stream the server can speak SOCKS5 over
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientStream for T {}

// Re-export main types at crate root for convenience
pub use address::{AddrSpec, Host};
pub use admission::{Admission, AdmissionGate};
pub use auth::{AuthContext, Authenticator, CredentialStore};
pub use config::Config;
pub use dialer::Dialer;
pub use error::ProtocolError;
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use request::Request;
pub use resolver::NameResolver;
pub use rules::{AddressRewriter, RuleDecision, RuleSet};
pub use server::Socks5Server;
