//! Bridge address configuration
//!
//! The bridge multiplexes backend channels behind one WebSocket endpoint;
//! query parameters select the logical channel, the socket personality, and
//! the payload policy.

use serde::{Deserialize, Serialize};

/// Well-known logical channel names
pub const HALRCMD_SERVICE: &str = "halrcmd";
pub const HALRCOMP_SERVICE: &str = "halrcomp";
pub const HALGROUP_SERVICE: &str = "halgroup";
pub const LOG_SERVICE: &str = "log";

/// How the bridge is reached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Bridge host
    #[serde(default = "default_host")]
    pub host: String,
    /// Bridge port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Scheme of the channel URI handed to the bridge
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            scheme: default_scheme(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7681
}

fn default_scheme() -> String {
    "tcp".to_string()
}

impl RemoteConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Bridge URL for a dealer channel
    pub fn dealer_url(&self, service: &str) -> String {
        format!(
            "ws://{}:{}/?connect={}://{}&type=dealer&policy=json",
            self.host, self.port, self.scheme, service
        )
    }

    /// Bridge URL for a subscriber channel; extra query parameters are
    /// appended in the given order
    pub fn subscriber_url(&self, service: &str, params: &[(&str, &str)]) -> String {
        let mut url = format!(
            "ws://{}:{}/?connect={}://{}&type=sub&policy=json",
            self.host, self.port, self.scheme, service
        );
        for (key, value) in params {
            url.push('&');
            url.push_str(key);
            url.push('=');
            url.push_str(value);
        }
        url
    }
}
