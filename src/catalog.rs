//! Static catalog of relay descriptors.
//!
//! The catalog is built once at startup and never mutated. Its order is the
//! tie-break order of the ranker and the key space of the concurrency pool.

use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Where a relay is hosted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Mainland,
    Overseas,
    #[default]
    Global,
}

/// Coarse priority class. Tier dominates the ranking score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Premium,
    #[default]
    Standard,
    Fallback,
}

/// How a relay embeds the target URL into its own request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlTemplate {
    /// Target is percent-encoded (`{url}` placeholder).
    Encoded { prefix: String, suffix: String },
    /// Target is inserted verbatim (`{raw}` placeholder).
    Raw { prefix: String, suffix: String },
}

impl UrlTemplate {
    /// Parses a template string. Returns `None` without a placeholder.
    pub fn parse(template: &str) -> Option<Self> {
        if let Some((prefix, suffix)) = template.split_once("{url}") {
            return Some(Self::Encoded {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            });
        }
        template
            .split_once("{raw}")
            .map(|(prefix, suffix)| Self::Raw {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            })
    }

    fn encoded(prefix: &str) -> Self {
        Self::Encoded {
            prefix: prefix.to_string(),
            suffix: String::new(),
        }
    }

    fn raw(prefix: &str) -> Self {
        Self::Raw {
            prefix: prefix.to_string(),
            suffix: String::new(),
        }
    }

    /// Produces the relay request URL for a target.
    pub fn build(&self, target: &str) -> String {
        match self {
            Self::Encoded { prefix, suffix } => {
                format!("{}{}{}", prefix, urlencoding::encode(target), suffix)
            }
            Self::Raw { prefix, suffix } => format!("{}{}{}", prefix, target, suffix),
        }
    }
}

impl fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encoded { prefix, suffix } => write!(f, "{}{{url}}{}", prefix, suffix),
            Self::Raw { prefix, suffix } => write!(f, "{}{{raw}}{}", prefix, suffix),
        }
    }
}

/// One relay endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyDescriptor {
    /// Unique name; key for stats and slots.
    pub name: String,
    pub url: UrlTemplate,
    /// The relay nests the payload in a `contents` field.
    pub wrap: bool,
    pub weight: u32,
    pub region: Region,
    pub tier: Tier,
}

impl ProxyDescriptor {
    /// Builds the relay request URL for a target.
    pub fn build_url(&self, target: &str) -> String {
        self.url.build(target)
    }
}

fn relay(
    name: &str,
    url: UrlTemplate,
    wrap: bool,
    weight: u32,
    region: Region,
    tier: Tier,
) -> ProxyDescriptor {
    ProxyDescriptor {
        name: name.to_string(),
        url,
        wrap,
        weight,
        region,
        tier,
    }
}

/// Ordered, immutable list of relays.
#[derive(Debug, Clone)]
pub struct ProxyCatalog {
    proxies: Vec<Arc<ProxyDescriptor>>,
}

impl ProxyCatalog {
    /// Creates a catalog, rejecting empty or duplicate names.
    pub fn new(descriptors: Vec<ProxyDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if descriptor.name.trim().is_empty() {
                return Err(FetchError::config_validation("Proxy name cannot be empty"));
            }
            if !seen.insert(descriptor.name.clone()) {
                return Err(FetchError::config_validation(format!(
                    "Duplicate proxy name: {}",
                    descriptor.name
                )));
            }
        }

        Ok(Self {
            proxies: descriptors.into_iter().map(Arc::new).collect(),
        })
    }

    /// Public CORS relays used when the configuration lists none.
    pub fn builtin() -> Self {
        let proxies = vec![
            relay(
                "allorigins-raw",
                UrlTemplate::encoded("https://api.allorigins.win/raw?url="),
                false,
                3,
                Region::Global,
                Tier::Premium,
            ),
            relay(
                "corsproxy-io",
                UrlTemplate::encoded("https://corsproxy.io/?url="),
                false,
                3,
                Region::Global,
                Tier::Premium,
            ),
            relay(
                "allorigins",
                UrlTemplate::encoded("https://api.allorigins.win/get?url="),
                true,
                2,
                Region::Global,
                Tier::Standard,
            ),
            relay(
                "codetabs",
                UrlTemplate::encoded("https://api.codetabs.com/v1/proxy?quest="),
                false,
                2,
                Region::Overseas,
                Tier::Standard,
            ),
            relay(
                "cors-lol",
                UrlTemplate::encoded("https://api.cors.lol/?url="),
                false,
                1,
                Region::Overseas,
                Tier::Standard,
            ),
            relay(
                "thingproxy",
                UrlTemplate::raw("https://thingproxy.freeboard.io/fetch/"),
                false,
                1,
                Region::Overseas,
                Tier::Fallback,
            ),
            relay(
                "whateverorigin",
                UrlTemplate::encoded("https://whateverorigin.org/get?url="),
                true,
                1,
                Region::Global,
                Tier::Fallback,
            ),
        ];

        Self {
            proxies: proxies.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProxyDescriptor>> {
        self.proxies.iter()
    }

    /// Looks up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&Arc<ProxyDescriptor>> {
        self.proxies.iter().find(|p| p.name == name)
    }

    /// Catalog position of a proxy.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.proxies.iter().position(|p| p.name == name)
    }
}
