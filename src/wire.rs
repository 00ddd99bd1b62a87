//! JSON wire format shared by the proxy and the agent.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Body of an agent's `/pull` long-poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: String,
}

/// Work item sent to an agent: scrape URIs keyed by agent id.
///
/// In practice a single entry is used (the agent the work is for); the map
/// shape keeps the format extensible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyRequest {
    #[serde(default)]
    pub scrape_requests: HashMap<String, String>,
}

impl ProxyRequest {
    pub fn for_target(id: &str, uri: &str) -> Self {
        let mut scrape_requests = HashMap::new();
        scrape_requests.insert(id.to_string(), uri.to_string());
        Self { scrape_requests }
    }
}

/// Result or heartbeat sent by an agent to `/push`.
///
/// A response with both maps empty (or absent) is a heartbeat carrying no
/// scrape data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payload: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub errors: HashMap<String, String>,
}

impl ProxyResponse {
    pub fn heartbeat(id: &str) -> Self {
        Self {
            id: id.to_string(),
            payload: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn success(id: &str, body: String) -> Self {
        let mut response = Self::heartbeat(id);
        response.payload.insert(id.to_string(), body);
        response
    }

    pub fn failure(id: &str, message: String) -> Self {
        let mut response = Self::heartbeat(id);
        response.errors.insert(id.to_string(), message);
        response
    }

    pub fn is_heartbeat(&self) -> bool {
        self.payload.is_empty() && self.errors.is_empty()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}
