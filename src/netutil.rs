//! Network helpers: SSRF-guarded HTTP client, base-domain extraction and
//! bounded body reads.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::Response;
use url::Url;

/// Settings for the SSRF-guarded client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Total request timeout.
    pub timeout: Duration,
    /// Permit connections that resolve to private or loopback addresses.
    pub allow_internal: bool,
    /// User-Agent header sent with every request.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            allow_internal: false,
            user_agent: concat!("RarefactorBot/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

const MAX_REDIRECTS: usize = 5;

// Connect-time guard: every hostname resolution runs through here, so a DNS
// answer that changes between pre-flight and dial still cannot reach private
// address space.
struct GuardedResolver;

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)?
                .collect();
            for addr in &addrs {
                if is_private_ip(addr.ip()) {
                    return Err(format!(
                        "blocked connection to private IP: {} (SSRF protection)",
                        addr.ip()
                    )
                    .into());
                }
            }
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok(addrs)
        })
    }
}

/// HTTP client that refuses to dial private address space.
///
/// Addresses are validated at connect time through the client's resolver, and
/// redirects are followed manually with a fresh guard on every hop, so
/// neither a rebinding DNS answer nor a `Location` pointing at a private or
/// cloud-metadata address is ever dialed.
#[derive(Clone)]
pub struct SafeHttpClient {
    client: reqwest::Client,
    allow_internal: bool,
}

impl SafeHttpClient {
    /// Builds the client.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout);
        if !config.allow_internal {
            builder = builder.dns_resolver(Arc::new(GuardedResolver));
        }
        let client = builder.build().context("failed to build http client")?;
        Ok(Self {
            client,
            allow_internal: config.allow_internal,
        })
    }

    /// Issues a GET, guarding the target and every redirect hop.
    pub async fn get(&self, url: &str) -> Result<Response> {
        let mut current = Url::parse(url).with_context(|| format!("invalid url: {url}"))?;

        for _ in 0..=MAX_REDIRECTS {
            self.guard(&current).await?;
            let response = self.client.get(current.clone()).send().await?;
            if !response.status().is_redirection() {
                return Ok(response);
            }

            let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|value| value.to_str().ok())
            else {
                return Ok(response);
            };
            current = current
                .join(location)
                .with_context(|| format!("invalid redirect location from {current}"))?;
        }

        bail!("too many redirects fetching {url}");
    }

    // Pre-flight check. The resolver only sees hostnames, so this is what
    // rejects literal-IP targets, including ones arriving via `Location`.
    async fn guard(&self, url: &Url) -> Result<()> {
        if self.allow_internal {
            return Ok(());
        }
        let host = url.host_str().context("url has no host")?;
        let port = url.port_or_known_default().unwrap_or(80);
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .with_context(|| format!("dns resolution failed for {host}"))?;
        for addr in addrs {
            if is_private_ip(addr.ip()) {
                bail!(
                    "blocked connection to private IP: {} (SSRF protection)",
                    addr.ip()
                );
            }
        }
        Ok(())
    }
}

/// True when the address belongs to a range the crawler must never dial.
pub fn is_private_ip(ip: IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };

    match ip {
        IpAddr::V4(v4) => {
            // Link-local covers the cloud metadata endpoint 169.254.169.254.
            v4.is_loopback() || v4.is_link_local() || v4.is_private() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            let unique_local = (seg[0] & 0xfe00) == 0xfc00;
            let link_local = (seg[0] & 0xffc0) == 0xfe80;
            v6.is_loopback() || v6.is_unspecified() || unique_local || link_local
        }
    }
}

/// Registrable base domain per the public-suffix list.
///
/// Falls back to the raw hostname when the host has no listed suffix
/// (IP literals, `localhost`).
pub fn base_domain(raw_url: &str) -> Result<String> {
    let url = Url::parse(raw_url).with_context(|| format!("invalid url: {raw_url}"))?;
    let host = url
        .host_str()
        .with_context(|| format!("url has no host: {raw_url}"))?;
    Ok(psl::domain_str(host).unwrap_or(host).to_string())
}

/// Reads a response body up to `cap` bytes, discarding the remainder.
pub async fn read_capped(response: Response, cap: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("body read failed")?;
        let remaining = cap.saturating_sub(body.len());
        if remaining == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }
    Ok(body)
}

/// Truncates on a char boundary so a byte budget never splits a code point.
pub fn truncate_chars(input: &str, max_bytes: usize) -> &str {
    if input.len() <= max_bytes {
        return input;
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn private_ranges_detected() {
        for blocked in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.169.254",
        ] {
            let ip: Ipv4Addr = blocked.parse().unwrap();
            assert!(is_private_ip(IpAddr::V4(ip)), "{blocked} should be blocked");
        }

        for open in ["8.8.8.8", "93.184.216.34", "172.32.0.1"] {
            let ip: Ipv4Addr = open.parse().unwrap();
            assert!(!is_private_ip(IpAddr::V4(ip)), "{open} should be allowed");
        }

        let ula: Ipv6Addr = "fc00::1".parse().unwrap();
        assert!(is_private_ip(IpAddr::V6(ula)));
        let fd: Ipv6Addr = "fdff::1".parse().unwrap();
        assert!(is_private_ip(IpAddr::V6(fd)));
        let global: Ipv6Addr = "2606:4700::1".parse().unwrap();
        assert!(!is_private_ip(IpAddr::V6(global)));
    }

    #[tokio::test]
    async fn loopback_get_is_blocked() {
        let client = SafeHttpClient::new(ClientConfig {
            allow_internal: false,
            ..ClientConfig::default()
        })
        .unwrap();

        let err = client.get("http://127.0.0.1:8080").await.unwrap_err();
        assert!(
            err.to_string().contains("blocked connection to private IP"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn redirects_are_followed_hop_by_hop() {
        use axum::response::Redirect;
        use axum::routing::get;

        let app = axum::Router::new()
            .route("/hop1", get(|| async { Redirect::temporary("/hop2") }))
            .route("/hop2", get(|| async { "done" }))
            .route("/loop", get(|| async { Redirect::temporary("/loop") }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = SafeHttpClient::new(ClientConfig {
            allow_internal: true,
            ..ClientConfig::default()
        })
        .unwrap();

        let response = client.get(&format!("http://{addr}/hop1")).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "done");

        let err = client
            .get(&format!("http://{addr}/loop"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too many redirects"));
    }

    #[test]
    fn base_domain_uses_public_suffix_list() {
        assert_eq!(base_domain("https://blog.example.co.uk/x").unwrap(), "example.co.uk");
        assert_eq!(base_domain("http://domain-a.com/page").unwrap(), "domain-a.com");
        assert_eq!(base_domain("http://127.0.0.1:9000/x").unwrap(), "127.0.0.1");
        assert!(base_domain(":").is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        // 🌍 is four bytes; cutting inside it must back off.
        assert_eq!(truncate_chars("a🌍b", 3), "a");
    }
}
