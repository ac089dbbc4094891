//! Client address extraction for rate limiting
//!
//! Proxy headers are only honoured when the deployment says a trusted proxy
//! sits in front of the server; otherwise anyone could pick their own key.

use log::{debug, warn};
use std::net::{IpAddr, SocketAddr};
use warp::http::HeaderMap;

/// Key used when no address can be determined
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Address to key rate-limit records on
pub fn client_key(
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> String {
    if trust_proxy_headers {
        if let Some(ip) = forwarded_ip(headers) {
            debug!("Using proxy-reported client address {}", ip);
            return ip.to_string();
        }
    }

    match remote_addr {
        Some(addr) => addr.ip().to_string(),
        None => {
            warn!("No client address available, using shared rate limit key");
            UNKNOWN_CLIENT.to_string()
        }
    }
}

/// Leftmost X-Forwarded-For entry, then X-Real-IP
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

    if let Some(value) = header("x-forwarded-for") {
        let first = value.split(',').next().unwrap_or("").trim();
        match first.parse::<IpAddr>() {
            Ok(ip) => return Some(ip),
            Err(_) => warn!("Invalid IP format in X-Forwarded-For header: {}", first),
        }
    }

    if let Some(value) = header("x-real-ip") {
        match value.trim().parse::<IpAddr>() {
            Ok(ip) => return Some(ip),
            Err(_) => warn!("Invalid IP format in X-Real-IP header: {}", value),
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp::http::header::HeaderValue;

    fn remote() -> Option<SocketAddr> {
        Some("203.0.113.9:5000".parse().unwrap())
    }

    #[test]
    fn test_headers_ignored_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1, 10.0.0.1"));

        assert_eq!(client_key(&headers, remote(), false), "203.0.113.9");
        assert_eq!(client_key(&headers, remote(), true), "198.51.100.1");
    }

    #[test]
    fn test_real_ip_fallback_and_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(client_key(&headers, remote(), true), "198.51.100.7");

        let empty = HeaderMap::new();
        assert_eq!(client_key(&empty, None, true), UNKNOWN_CLIENT);
    }
}
