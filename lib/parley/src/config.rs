use crate::DEFAULT_PORT;
use serde_derive::{Deserialize, Serialize};

/// Configuration record consumed by `serve`. The host program decides where
/// it comes from; any field left out of a config file keeps its default.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub max_connections: u32,
    /// Advisory only; logged at startup but not enforced.
    pub max_chatrooms: u32,
    pub verbose: bool,
    pub logging_enabled: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: DEFAULT_PORT,
            max_connections: 100,
            max_chatrooms: 100,
            verbose: false,
            logging_enabled: false,
        }
    }
}
