//! Endpoint-Konfiguration
//!
//! Eine Basis-URL (`ws://` oder `wss://`) plus ein zufälliges Session-Segment
//! pro Client-Session. Ungültige Basis-URLs fallen auf den Default zurück;
//! der Fehler wird zurückgegeben, damit der Aufrufer ihn melden kann.

use crate::audio::TARGET_SAMPLE_RATE;
use thiserror::Error;
use url::{Host, Url};
use uuid::Uuid;

/// Default-Endpoint des lokalen Sprach-Servers
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8100/ws";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Endpoint '{url}' must use ws:// or wss://, got {scheme}://")]
    UnsupportedScheme { url: String, scheme: String },
}

/// Aufgelöste Konfiguration einer Client-Session
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint inklusive Session-Segment
    pub endpoint: Url,
    pub session_id: Uuid,
    /// Sample Rate des Playback-Buffers, bis der erste Chunk eine andere ankündigt
    pub initial_playback_rate: u32,
}

impl ClientConfig {
    /// Löst die Basis-URL auf und hängt ein neues Session-Segment an
    pub fn resolve(base: Option<&str>) -> (Self, Option<ConfigError>) {
        let (base, error) = match base.map(parse_base) {
            None => (default_base(), None),
            Some(Ok(url)) => (url, None),
            Some(Err(e)) => {
                tracing::warn!("{}; falling back to {}", e, DEFAULT_ENDPOINT);
                (default_base(), Some(e))
            }
        };

        let session_id = Uuid::new_v4();
        let endpoint = with_session(base, session_id);
        tracing::debug!("Resolved endpoint: {}", endpoint);

        (
            Self {
                endpoint,
                session_id,
                initial_playback_rate: TARGET_SAMPLE_RATE,
            },
            error,
        )
    }

    /// `wss://` oder ein Loopback-Host
    pub fn is_secure_context(&self) -> bool {
        if self.endpoint.scheme() == "wss" {
            return true;
        }
        match self.endpoint.host() {
            Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
            Some(Host::Ipv4(addr)) => addr.is_loopback(),
            Some(Host::Ipv6(addr)) => addr.is_loopback(),
            None => false,
        }
    }
}

fn parse_base(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(ConfigError::UnsupportedScheme {
            url: raw.to_string(),
            scheme: scheme.to_string(),
        }),
    }
}

fn default_base() -> Url {
    // Konstante, immer gültig
    Url::parse(DEFAULT_ENDPOINT).unwrap_or_else(|_| unreachable!())
}

fn with_session(mut base: Url, session_id: Uuid) -> Url {
    let path = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        session_id.as_hyphenated()
    );
    base.set_path(&path);
    base
}
