//! Proxy addresses and the egress route a lane sends through.

use std::fmt;

use url::Url;

use crate::error::ProxyError;

const SOCKS5_SCHEME: &str = "socks5://";

/// A SOCKS5 proxy, candidate or validated.
///
/// `address` is the line as it was loaded (`host:port` or `user:pass@host:port`,
/// with or without a `socks5://` prefix) and is the proxy's identity everywhere:
/// in the unique-IP registry, in the client pool and in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    pub address: String,
}

impl Proxy {
    /// Create a new proxy from an address line.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// The address normalized to a `socks5://` URL string.
    pub fn socks5_url(&self) -> String {
        if self.address.starts_with(SOCKS5_SCHEME) {
            self.address.clone()
        } else {
            format!("{SOCKS5_SCHEME}{}", self.address)
        }
    }

    /// Parse the normalized URL, rejecting addresses without a host.
    pub fn parse(&self) -> Result<Url, ProxyError> {
        let url = Url::parse(&self.socks5_url()).map_err(|source| ProxyError::Parse {
            proxy: self.address.clone(),
            source,
        })?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ProxyError::Parse {
                proxy: self.address.clone(),
                source: url::ParseError::EmptyHost,
            });
        }
        Ok(url)
    }

    /// Build the reqwest proxy for this address.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, ProxyError> {
        // reqwest reads SOCKS5 credentials from the URL itself
        let url = self.parse()?;
        reqwest::Proxy::all(url.as_str()).map_err(|e| ProxyError::Dial {
            proxy: self.address.clone(),
            attempts: 1,
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// The route a lane's requests leave through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Egress {
    /// No proxy; requests leave from this host.
    Direct,
    /// Through a validated SOCKS5 proxy.
    Proxy(Proxy),
}

impl Egress {
    /// Key used to pool clients for this route.
    pub fn key(&self) -> &str {
        match self {
            Egress::Direct => "direct",
            Egress::Proxy(proxy) => &proxy.address,
        }
    }
}

impl fmt::Display for Egress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
