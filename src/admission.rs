//! Pre-authentication admission gate
//!
//! Every accepted connection is judged on its peer IP alone, before a
//! single protocol byte is read. First match wins:
//!
//! 1. `172.16.0.0/12` (container networking) -> admitted as infrastructure
//! 2. `100.64.0.0/10` (CGNAT range used by mesh VPN overlays) -> admitted as mesh
//! 3. exact member of the operator allow-list -> admitted as allow-listed
//! 4. anything else -> denied
//!
//! Only IPv4 addresses take part in the range checks. IPv4-mapped IPv6
//! peers (`::ffff:a.b.c.d`) are treated as the IPv4 address they carry.

use ipnet::Ipv4Net;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

const INFRASTRUCTURE_NET: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(172, 16, 0, 0), 12);
const MESH_NET: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(100, 64, 0, 0), 10);

/// Admission is the gate's verdict for one peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Infrastructure,
    Mesh,
    AllowListed,
    Denied,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Denied)
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Admission::Infrastructure => write!(f, "infrastructure"),
            Admission::Mesh => write!(f, "mesh"),
            Admission::AllowListed => write!(f, "allow-listed"),
            Admission::Denied => write!(f, "rejected"),
        }
    }
}

/// AdmissionGate holds the operator allow-list, fixed at construction
#[derive(Debug, Clone, Default)]
pub struct AdmissionGate {
    allow_list: Vec<IpAddr>,
}

impl AdmissionGate {
    /// new builds a gate; an empty allow-list leaves only the two
    /// reserved ranges admitted
    pub fn new(allow_list: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            allow_list: allow_list.into_iter().map(|ip| ip.to_canonical()).collect(),
        }
    }

    pub fn allow_list(&self) -> &[IpAddr] {
        &self.allow_list
    }

    /// check classifies a peer address
    pub fn check(&self, ip: IpAddr) -> Admission {
        let ip = ip.to_canonical();

        if let IpAddr::V4(v4) = ip {
            if INFRASTRUCTURE_NET.contains(&v4) {
                return Admission::Infrastructure;
            }
            if MESH_NET.contains(&v4) {
                return Admission::Mesh;
            }
        }

        // Allow-lists are small, a linear scan is fine
        if self.allow_list.contains(&ip) {
            Admission::AllowListed
        } else {
            Admission::Denied
        }
    }
}
