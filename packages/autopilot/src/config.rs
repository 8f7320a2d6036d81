use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::AutopilotError;
use crate::triggers::{DEFAULT_TRIGGERS, TriggerSet};

// =============================================================================
// File config (figment-deserialized from defaults / autopilot.toml / env vars)
// =============================================================================
//
//   autopilot.toml:  interval_ms = 5000
//                    triggers = ["approve?", "press 1"]
//
//   env var:         AUTOPILOT_INTERVAL_MS=5000
//                    AUTOPILOT_TRIGGERS='["approve?", "press 1"]'

/// Top-level tunables, deserialized by figment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Program and arguments to run
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    /// Keystrokes written on every response
    #[serde(default = "default_response")]
    pub response: String,
    /// Timer period in milliseconds (0 disables the timer)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// How long a terminated child gets before it is killed
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_triggers")]
    pub triggers: Vec<String>,
    /// Echo child output to stdout
    #[serde(default = "default_echo")]
    pub echo: bool,
    /// Also answer trigger phrases printed on stderr
    #[serde(default)]
    pub scan_stderr: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            response: default_response(),
            interval_ms: default_interval_ms(),
            grace_ms: default_grace_ms(),
            triggers: default_triggers(),
            echo: default_echo(),
            scan_stderr: false,
        }
    }
}

fn default_command() -> Vec<String> {
    vec!["claude".to_string(), "code".to_string()]
}
fn default_response() -> String {
    "1\n".to_string()
}
fn default_interval_ms() -> u64 {
    2000
}
fn default_grace_ms() -> u64 {
    3000
}
fn default_triggers() -> Vec<String> {
    DEFAULT_TRIGGERS.iter().map(|s| s.to_string()).collect()
}
fn default_echo() -> bool {
    true
}

/// Build a figment that layers: defaults → config file → AUTOPILOT_* env vars.
///
/// A missing config file is not an error; the layer is simply empty.
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("AUTOPILOT_").split("__"))
}

impl FileConfig {
    pub fn load(config_file: &Path) -> Result<Self, AutopilotError> {
        Ok(load_config(config_file).extract()?)
    }
}

// =============================================================================
// Runtime config (derived from FileConfig, used by the responder)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ResponderConfig {
    pub response: String,
    /// None (or a zero period) disables the timer activity
    pub interval: Option<Duration>,
    pub grace_period: Duration,
    pub triggers: TriggerSet,
    pub scan_stderr: bool,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl ResponderConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            response: fc.response.clone(),
            interval: if fc.interval_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(fc.interval_ms))
            },
            grace_period: Duration::from_millis(fc.grace_ms),
            triggers: TriggerSet::new(&fc.triggers),
            scan_stderr: fc.scan_stderr,
        }
    }
}
