//! Parse source endpoints and classify them as local or remote.
//!
//! Local sources (loopback, private networks, link-local) are usually faster and more reliable
//! than public peers, so the [Pool](crate::pool::Pool) favors them when selecting a source.

use crate::Error;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// A validated source endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
    local: bool,
}

impl Endpoint {
    /// Parse an `http://` or `https://` URL.
    pub fn parse(url: &str) -> Result<Self, Error> {
        let url = url.trim().trim_end_matches('/');
        let parsed = Url::parse(url).map_err(|_| Error::InvalidEndpoint(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidEndpoint(url.to_string()));
        }
        let local = match parsed.host() {
            Some(Host::Domain(domain)) => is_local_domain(domain),
            Some(Host::Ipv4(ip)) => is_local_ipv4(ip),
            Some(Host::Ipv6(ip)) => is_local_ipv6(ip),
            None => return Err(Error::InvalidEndpoint(url.to_string())),
        };
        Ok(Self {
            url: url.to_string(),
            local,
        })
    }

    /// The endpoint as configured (without a trailing slash).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the endpoint resolves to this machine or a private network.
    pub fn is_local(&self) -> bool {
        self.local
    }
}

fn is_local_domain(domain: &str) -> bool {
    domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local")
}

fn is_local_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()                                            // 127.0.0.0/8
        || ip.is_unspecified()                                  // 0.0.0.0
        || ip.is_link_local()                                   // 169.254.0.0/16
        || octets[0] == 10                                      // 10.0.0.0/8
        || (octets[0] == 172 && (16..=31).contains(&octets[1])) // 172.16.0.0/12
        || (octets[0] == 192 && octets[1] == 168)               // 192.168.0.0/16
        || (octets[0] == 100 && (64..=127).contains(&octets[1])) // 100.64.0.0/10
}

fn is_local_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_local_ipv4(mapped);
    }
    let segments = ip.segments();
    ip.is_loopback()                          // ::1
        || ip.is_unspecified()                // ::
        || (segments[0] & 0xffc0) == 0xfe80   // fe80::/10
        || (segments[0] & 0xfe00) == 0xfc00 // fc00::/7
}
