//! Deterministic outbound request identity
//!
//! Every target URL maps to one User-Agent from a fixed table, so repeated
//! fetches of a resource always look like the same client. `Referer` and
//! `Origin` are derived from the target's own origin.

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use tracing::debug;
use url::Url;
use xxhash_rust::xxh3::xxh3_64;

const AUDIO_ACCEPT: &str =
    "audio/mpeg,audio/mp3,audio/wav,audio/ogg,audio/aac,audio/m4a,audio/webm,audio/*,*/*;q=0.9";

/// Default User-Agent table
pub fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
        "Mozilla/5.0 (Linux; Android 14; SM-G998B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
    ]
    .iter()
    .map(|ua| ua.to_string())
    .collect()
}

/// Hosts serving raw repository content
pub fn default_raw_content_hosts() -> Vec<String> {
    vec![
        "raw.githubusercontent.com".to_string(),
        "objects.githubusercontent.com".to_string(),
        "gist.githubusercontent.com".to_string(),
    ]
}

/// Outbound headers synthesized for one target
#[derive(Debug, Clone)]
pub struct SpoofedIdentity {
    pub headers: HeaderMap,
    /// Target is a raw-content host; the fetcher stretches its timeout
    pub raw_content: bool,
}

/// Builds stable outbound identities
#[derive(Debug, Clone)]
pub struct IdentitySpoofer {
    user_agents: Vec<String>,
    raw_content_hosts: Vec<String>,
}

impl Default for IdentitySpoofer {
    fn default() -> Self {
        Self::new(default_user_agents(), default_raw_content_hosts())
    }
}

impl IdentitySpoofer {
    /// Create a spoofer; an empty table falls back to the default one.
    pub fn new(user_agents: Vec<String>, raw_content_hosts: Vec<String>) -> Self {
        let user_agents = if user_agents.is_empty() {
            default_user_agents()
        } else {
            user_agents
        };

        IdentitySpoofer {
            user_agents,
            raw_content_hosts: raw_content_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Pick the User-Agent for a target. Same URL, same entry, in every process.
    pub fn user_agent_for(&self, target: &str) -> &str {
        let hash = xxh3_64(target.to_ascii_lowercase().as_bytes());
        let index = (hash % self.user_agents.len() as u64) as usize;
        &self.user_agents[index]
    }

    /// Whether the target's host is a raw-content origin
    pub fn is_raw_content(&self, target: &str) -> bool {
        Url::parse(target)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .map(|host| self.raw_content_hosts.iter().any(|raw| *raw == host))
            .unwrap_or(false)
    }

    /// Synthesize the outbound header set for a target.
    ///
    /// An inbound `Range` is copied verbatim. An unparseable target simply gets
    /// no `Referer`/`Origin`.
    pub fn identity_for(&self, target: &str, range: Option<&str>) -> SpoofedIdentity {
        let mut headers = HeaderMap::new();
        let raw_content = self.is_raw_content(target);

        insert(&mut headers, "user-agent", self.user_agent_for(target));
        insert(&mut headers, "accept-encoding", "identity");
        insert(&mut headers, "cache-control", "no-cache");

        if raw_content {
            insert(&mut headers, "accept", "*/*");
            insert(&mut headers, "pragma", "no-cache");
        } else {
            insert(&mut headers, "accept", AUDIO_ACCEPT);
        }

        if let Some(range) = range {
            insert(&mut headers, "range", range);
            insert(&mut headers, "x-requested-with", "Range");
        }

        match Url::parse(target) {
            Ok(url) => {
                let origin = url.origin().ascii_serialization();
                if origin != "null" {
                    insert(&mut headers, "referer", &format!("{}/", origin));
                    insert(&mut headers, "origin", &origin);
                }
            }
            Err(e) => debug!("Target {} did not parse, omitting Referer/Origin: {}", target, e),
        }

        SpoofedIdentity {
            headers,
            raw_content,
        }
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
