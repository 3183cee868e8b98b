use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Where and how to reach the simulation server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[schemars(title = "Connection", inline)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Server host name or address.
    #[schemars(title = "Host")]
    pub host: String,
    /// Server port.
    #[schemars(title = "Port", range(min = 1, max = 65535))]
    pub port: u16,
    /// Channel connect timeout in milliseconds.
    #[schemars(title = "Connect Timeout (ms)", range(min = 100, max = 60000))]
    pub connect_timeout_ms: u64,
    /// HTTP/2 keep-alive ping interval in milliseconds; 0 disables pings.
    #[schemars(skip)]
    pub keep_alive_interval_ms: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 38801,
            connect_timeout_ms: 5000,
            keep_alive_interval_ms: 0,
        }
    }
}
