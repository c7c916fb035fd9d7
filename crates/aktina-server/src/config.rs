use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Idle bound for event subscriptions; a stream that stays silent this
    /// long is closed rather than held open forever.
    #[serde(default = "ServerConfig::default_subscribe_idle_secs")]
    pub subscribe_idle_secs: u64,
}

impl ServerConfig {
    fn default_subscribe_idle_secs() -> u64 {
        120
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            subscribe_idle_secs: Self::default_subscribe_idle_secs(),
        }
    }
}
