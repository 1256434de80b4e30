//! Session configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default baud rate for MicroPython serial devices.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Grace window for a polite helper shutdown before a forceful kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Configuration for one device session.
///
/// The helper is spawned with its install directory as working directory so
/// it can resolve its own support files regardless of where the orchestrator
/// runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial device identifier, e.g. `"COM3"` or `"/dev/ttyUSB0"`.
    pub device: String,
    /// Path to the helper executable.
    pub helper_path: PathBuf,
    /// Working directory for the helper. Defaults to the helper's parent
    /// directory when unset.
    pub install_dir: Option<PathBuf>,
    /// Serial baud rate passed to the helper.
    pub baud_rate: u32,
    /// How long a graceful disconnect waits before killing the helper.
    #[serde(with = "grace_millis")]
    pub grace_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            helper_path: PathBuf::new(),
            install_dir: None,
            baud_rate: DEFAULT_BAUD_RATE,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl SessionConfig {
    pub fn new(device: impl Into<String>, helper_path: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            helper_path: helper_path.into(),
            ..Self::default()
        }
    }

    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    pub fn install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Effective working directory for the helper process.
    pub fn effective_install_dir(&self) -> Option<&Path> {
        self.install_dir
            .as_deref()
            .or_else(|| self.helper_path.parent().filter(|p| !p.as_os_str().is_empty()))
    }
}

mod grace_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_expectations() {
        let config = SessionConfig::new("COM3", "/opt/helper/wrapper");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.grace_period, Duration::from_millis(500));
        assert_eq!(
            config.effective_install_dir(),
            Some(Path::new("/opt/helper"))
        );
    }

    #[test]
    fn install_dir_override_wins() {
        let config =
            SessionConfig::new("/dev/ttyACM0", "/opt/helper/wrapper").install_dir("/srv/helper");
        assert_eq!(config.effective_install_dir(), Some(Path::new("/srv/helper")));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"device": "COM7", "helper_path": "/usr/bin/helper"}"#)
                .unwrap();
        assert_eq!(config.device, "COM7");
        assert_eq!(config.baud_rate, 115_200);
    }
}
