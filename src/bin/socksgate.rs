use anyhow::{Context, Result};
use clap::Parser;
use socksgate::{Config, Socks5Server, auth::StaticCredentials, rules::PermitDestAddrPattern};
use std::net::IpAddr;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS5 proxy with an IP admission gate", long_about = None)]
struct Args {
    /// Listener port
    #[arg(long, env = "PROXY_PORT", default_value_t = 1080)]
    port: u16,

    /// Listener host
    #[arg(long, env = "PROXY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Username for SOCKS5 proxy. Password auth is on when either this or
    /// the password is set
    #[arg(short, long, env = "PROXY_USER", default_value = "")]
    user: String,

    /// Password for SOCKS5 proxy
    #[arg(short, long, env = "PROXY_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Only proxy to host names matching this pattern, e.g. `*.example.com`
    #[arg(long, env = "ALLOWED_DEST_FQDN", default_value = "")]
    allowed_dest_fqdn: String,

    /// Comma separated client IPs admitted besides the reserved ranges
    #[arg(long, env = "ALLOWED_IPS", value_delimiter = ',')]
    allowed_ips: Vec<String>,

    /// Local IP for BIND listeners and UDP associations
    #[arg(long, env = "PROXY_BIND_IP", default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Seconds BIND waits for the inbound connection (waits forever if unset)
    #[arg(long, env = "PROXY_BIND_TIMEOUT")]
    bind_timeout: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = Config::default()
        .with_bind_ip(args.bind_ip)
        .with_bind_timeout(args.bind_timeout.map(Duration::from_secs));

    // Check for auth and grab it if present
    match credentials(&args.user, &args.password) {
        Some(credentials) => {
            info!("Authentication enabled for user {:?}", args.user);
            config = config.with_credentials(credentials);
        }
        None => info!("Authentication disabled"),
    }

    let pattern = args.allowed_dest_fqdn.trim();
    if !pattern.is_empty() {
        info!("Destinations restricted to {pattern}");
        config = config.with_rules(PermitDestAddrPattern::new(pattern));
    }

    let allowed_ips = parse_allowed_ips(&args.allowed_ips)?;
    if !allowed_ips.is_empty() {
        info!("Allow-listed client IPs: {allowed_ips:?}");
    }

    // Instantiate server
    let listen_addr = match args.host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", args.port),
        _ => format!("{}:{}", args.host, args.port),
    };
    let mut server = Socks5Server::new(listen_addr, config, allowed_ips);

    // Run it
    info!("Start listening proxy service on {}", server.listen_addr);
    server.run().await
}

/// credentials enables username/password auth as soon as either half is
/// set. An empty password is a valid password
fn credentials(user: &str, password: &str) -> Option<StaticCredentials> {
    if user.is_empty() && password.is_empty() {
        None
    } else {
        Some(StaticCredentials::single(user, password))
    }
}

/// parse_allowed_ips turns the raw allow-list into addresses. Blank entries
/// are skipped; anything else that is not an IP is a startup error
fn parse_allowed_ips(raw: &[String]) -> Result<Vec<IpAddr>> {
    raw.iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<IpAddr>()
                .with_context(|| format!("invalid IP in ALLOWED_IPS: {entry:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use socksgate::CredentialStore;

    #[test]
    fn parses_env_style_options() {
        let args = Args::try_parse_from([
            "socksgate",
            "--port",
            "1081",
            "--allowed-ips",
            "10.0.0.1,2001:db8::1",
            "--allowed-dest-fqdn",
            "*.example.com",
        ])
        .unwrap();

        assert_eq!(args.port, 1081);
        assert_eq!(args.allowed_ips, ["10.0.0.1", "2001:db8::1"]);
        assert_eq!(args.allowed_dest_fqdn, "*.example.com");
        assert_eq!(args.bind_timeout, None);
    }

    #[test]
    fn credentials_need_only_one_half() {
        assert!(credentials("", "").is_none());

        let store = credentials("alice", "").unwrap();
        assert!(store.valid("alice", ""));
        assert!(!store.valid("alice", "guess"));

        let store = credentials("", "s3cret").unwrap();
        assert!(store.valid("", "s3cret"));
    }

    #[test]
    fn allow_list_skips_blanks() {
        let raw = vec!["".to_string(), " 10.0.0.1 ".to_string()];
        let ips = parse_allowed_ips(&raw).unwrap();
        assert_eq!(ips, ["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn allow_list_rejects_garbage() {
        let raw = vec!["10.0.0.1".to_string(), "not-an-ip".to_string()];
        assert!(parse_allowed_ips(&raw).is_err());
    }
}
