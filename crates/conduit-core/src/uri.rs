//! Slot URIs: `<proto>://<host>:<port>/<taskId>/<slotName>`.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Scheme of slots served directly by a peer's data-plane endpoint.
pub const PEER_SCHEME: &str = "fs";

/// Scheme of slots reached through a relay session.
pub const RELAY_SCHEME: &str = "relay";

/// Query parameter carrying the relay session id.
pub const SESSION_QUERY: &str = "session";

/// Object-storage schemes understood by the resolver.
pub const STORAGE_SCHEMES: &[&str] = &["s3", "memory", "azure", "storage"];

/// How a URI is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriKind {
    /// A peer's data-plane endpoint.
    Peer,
    /// A relay endpoint fronting a terminal session.
    Relay,
    /// An object-storage location.
    Storage,
}

impl UriKind {
    /// Classifies a URI by its scheme.
    pub fn classify(url: &Url) -> Option<Self> {
        match url.scheme() {
            PEER_SCHEME | "http" | "https" => Some(Self::Peer),
            RELAY_SCHEME => Some(Self::Relay),
            scheme if STORAGE_SCHEMES.contains(&scheme) => Some(Self::Storage),
            _ => None,
        }
    }
}

/// Globally resolvable address of a slot.
///
/// The path carries at least two segments: the task id, then the slot name.
/// The slot name keeps its leading `/` and may itself contain `/`.
/// Path segments are percent-encoded in the URI and decoded by the accessors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[display("{url}")]
#[serde(try_from = "String", into = "String")]
pub struct SlotUri {
    url: Url,
    task_id: String,
    slot_name: String,
}

impl SlotUri {
    /// Parses and validates a slot URI.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| {
            Error::invalid_input(format!("malformed slot uri '{input}': {e}")).with_source(e)
        })?;
        Self::try_from(url)
    }

    /// Builds the URI of a slot under a base endpoint: `base/taskId/slotName`.
    pub fn for_slot(base: &Url, task_id: &str, slot_name: &str) -> Result<Self> {
        if task_id.is_empty() || task_id.contains('/') {
            return Err(Error::invalid_input(format!("invalid task id '{task_id}'")));
        }

        let name: Vec<_> = slot_name
            .trim_start_matches('/')
            .split('/')
            .map(urlencoding::encode)
            .collect();
        let mut url = base.clone();
        url.set_path(&format!("/{}/{}", urlencoding::encode(task_id), name.join("/")));
        url.set_query(None);
        url.set_fragment(None);
        Self::try_from(url)
    }

    /// Returns the task id segment.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Returns the slot name, including its leading `/`.
    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    /// Returns the URI scheme.
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Returns `host:port` of the endpoint serving this slot.
    pub fn authority(&self) -> String {
        match (self.url.host_str(), self.url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        }
    }

    /// Returns the relay session id carried in the query string.
    pub fn session_id(&self) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == SESSION_QUERY)
            .map(|(_, value)| value.into_owned())
    }

    /// Returns how this URI is reached.
    pub fn kind(&self) -> Option<UriKind> {
        UriKind::classify(&self.url)
    }

    /// Rewrites this URI to point at a relay endpoint for the given session.
    pub fn via_relay(&self, relay_authority: &str, session_id: &str) -> Result<Self> {
        let rewritten = format!(
            "{RELAY_SCHEME}://{relay_authority}{}?{SESSION_QUERY}={}",
            self.url.path(),
            urlencoding::encode(session_id)
        );
        Self::parse(&rewritten)
    }

    /// Returns the underlying URL.
    pub fn as_url(&self) -> &Url {
        &self.url
    }

    /// Returns the URI as a string slice.
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

fn split_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.strip_prefix('/')?;
    let split = trimmed.find('/')?;
    let (task, name) = trimmed.split_at(split);
    (!task.is_empty() && name.len() > 1).then_some((task, name))
}

impl TryFrom<Url> for SlotUri {
    type Error = Error;

    fn try_from(url: Url) -> Result<Self> {
        let Some((task_id, slot_name)) = split_path(url.path()) else {
            return Err(Error::invalid_input(format!(
                "slot uri '{url}' must have a task id and a slot name in its path"
            )));
        };

        let decode = |segment: &str| {
            urlencoding::decode(segment).map(|s| s.into_owned()).map_err(|e| {
                Error::invalid_input(format!("slot uri '{url}' is not valid UTF-8")).with_source(e)
            })
        };
        let task_id = decode(task_id)?;
        let slot_name = decode(slot_name)?;
        Ok(Self {
            url,
            task_id,
            slot_name,
        })
    }
}

impl TryFrom<String> for SlotUri {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SlotUri> for String {
    fn from(uri: SlotUri) -> Self {
        uri.url.into()
    }
}
