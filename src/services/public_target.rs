// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Guard against fetching media from internal network targets.

use crate::error::ImportError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_MEDIA_BYTES: usize = 64 * 1024 * 1024;

/// Whether an address is routable on the public internet.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        // Carrier-grade NAT 100.64.0.0/10
        || (a == 100 && (b & 0xc0) == 64)
        // IETF protocol assignments 192.0.0.0/24
        || (a == 192 && b == 0 && c == 0)
        // Benchmarking 198.18.0.0/15
        || (a == 198 && (b & 0xfe) == 18)
        // Reserved 240.0.0.0/4
        || a >= 240)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // Unique local fc00::/7
        || (first & 0xfe00) == 0xfc00
        // Link local fe80::/10
        || (first & 0xffc0) == 0xfe80
        // Documentation 2001:db8::/32
        || (first == 0x2001 && ip.segments()[1] == 0x0db8))
}

/// Resolve a URL's host and require every address to be public.
///
/// Returns one vetted address so the caller can connect to exactly what was
/// checked.
pub async fn ensure_public_target(url: &reqwest::Url) -> Result<SocketAddr, ImportError> {
    let unsafe_target = || ImportError::UnsafeMediaTarget(url.to_string());

    if !matches!(url.scheme(), "http" | "https") {
        return Err(unsafe_target());
    }
    let host = url.host_str().ok_or_else(unsafe_target)?;
    let port = url.port_or_known_default().ok_or_else(unsafe_target)?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| unsafe_target())?
        .collect();

    if addrs.is_empty() || !addrs.iter().all(|a| is_public_ip(a.ip())) {
        return Err(unsafe_target());
    }
    Ok(addrs[0])
}

/// Fetches media referenced by URL after the public-target check.
#[derive(Clone, Default)]
pub struct RemoteMediaClient;

impl RemoteMediaClient {
    pub fn new() -> Self {
        Self
    }

    pub async fn fetch(&self, raw_url: &str) -> Result<Vec<u8>, ImportError> {
        let url = reqwest::Url::parse(raw_url)
            .map_err(|_| ImportError::UnsafeMediaTarget(raw_url.to_string()))?;
        let addr = ensure_public_target(&url).await?;
        let host = url.host_str().unwrap_or_default().to_string();

        // Pin the vetted address and refuse redirects to anywhere else
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .resolve(&host, addr)
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| ImportError::UnsafeMediaTarget(format!("{}: {}", raw_url, e)))?;

        let mut response = http
            .get(url)
            .send()
            .await
            .map_err(|e| ImportError::UnsafeMediaTarget(format!("{}: {}", raw_url, e)))?;

        if !response.status().is_success() {
            return Err(ImportError::UnsafeMediaTarget(format!(
                "{}: HTTP {}",
                raw_url,
                response.status()
            )));
        }

        let too_large = || ImportError::UnsafeMediaTarget(format!("{}: too large", raw_url));
        if response
            .content_length()
            .is_some_and(|len| len > MAX_MEDIA_BYTES as u64)
        {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ImportError::UnsafeMediaTarget(format!("{}: {}", raw_url, e)))?
        {
            if !append_capped(&mut body, &chunk, MAX_MEDIA_BYTES) {
                return Err(too_large());
            }
        }
        Ok(body)
    }
}

/// Append `chunk` unless the body would grow past `limit`.
fn append_capped(body: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    if body.len() + chunk.len() > limit {
        return false;
    }
    body.extend_from_slice(chunk);
    true
}
