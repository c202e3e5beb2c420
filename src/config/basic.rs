use serde::{Deserialize, Serialize};

/// Basic (process) configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicConfig {
    /// Log level for tracing subscriber initialization (e.g., "error", "warn", "info", "debug", "trace").
    /// TOML: `basic.loglevel`. Default: `info`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Human readable name of this instance, attached to startup logs.
    /// TOML: `basic.instance_name`. Default: `rota`.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            loglevel: default_loglevel(),
            instance_name: default_instance_name(),
        }
    }
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_instance_name() -> String {
    "rota".to_string()
}
