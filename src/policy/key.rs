use crate::policy::{KeyMode, Policy};
use actix_web::dev::ServiceRequest;
use actix_web::HttpMessage;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Key used when nothing else identifies the client.
pub const UNKNOWN_KEY: &str = "unknown";

/// The authenticated caller, inserted into the request extensions by an upstream
/// authentication layer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientIdentity(pub String);

/// Derives the throttling key for a request under `policy`.
///
/// Resolution order: the policy's key function, the [ClientIdentity] (identity scoped policies
/// only), the client address, then [UNKNOWN_KEY]. The result is never empty.
///
/// # Security
///
/// The address comes from
/// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr)
/// which honours `Forwarded` headers, so it is only trustworthy behind a proxy that you control.
pub fn resolve_key(req: &ServiceRequest, policy: &Policy) -> String {
    if let Some(f) = policy.key_fn() {
        let key = f(req);
        if !key.is_empty() {
            return key;
        }
    }
    if policy.key_mode() == KeyMode::Identity {
        if let Some(identity) = req.extensions().get::<ClientIdentity>() {
            if !identity.0.is_empty() {
                return format!("user:{}", identity.0);
            }
        }
    }
    req.connection_info()
        .realip_remote_addr()
        .and_then(ip_key)
        .unwrap_or_else(|| UNKNOWN_KEY.to_owned())
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(addr: &str) -> Option<String> {
    let ip = addr
        .parse::<IpAddr>()
        .or_else(|_| addr.parse::<SocketAddr>().map(|s| s.ip()))
        .ok()?;
    Some(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Some(v4.to_string());
            }
            let s = v6.segments();
            let subnet = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
            format!("{subnet}/64")
        }
    })
}
