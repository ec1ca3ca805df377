//! Browser launch configuration.
//!
//! Constructed once per session from CLI flags (or by the caller) and
//! passed by reference into the flow machine; there is no process-global
//! mutable configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Chromium headless switch. The browser accepts three spellings:
/// the `new` headless implementation, classic headless, or headful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeadlessMode {
    #[default]
    New,
    Enabled,
    Disabled,
}

impl FromStr for HeadlessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(HeadlessMode::New),
            "true" => Ok(HeadlessMode::Enabled),
            "false" => Ok(HeadlessMode::Disabled),
            other => Err(format!(
                "invalid headless mode {:?} (expected new|true|false)",
                other
            )),
        }
    }
}

/// Everything needed to launch one browser instance for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserLaunchConfig {
    pub headless: HeadlessMode,
    pub disable_gpu: bool,
    /// Local proxy address, e.g. `http://127.0.0.1:7890`.
    pub proxy: Option<String>,
    /// Hosts that bypass the proxy.
    pub proxy_bypass: Vec<String>,
    /// Profile directory; a unique directory under the system temp dir is
    /// created (and removed on drop) when unset.
    pub user_data_dir: Option<PathBuf>,
    /// Explicit browser executable; system Chrome is auto-detected when unset.
    pub chrome_path: Option<PathBuf>,
    /// Where provisioned extensions are materialized.
    pub extension_root: PathBuf,
    /// Logical ids of extensions to load at launch.
    pub extensions: Vec<String>,
    pub user_agent: String,
    pub window_size: (u32, u32),
    pub no_sandbox: bool,
}

impl Default for BrowserLaunchConfig {
    fn default() -> Self {
        Self {
            headless: HeadlessMode::default(),
            disable_gpu: false,
            proxy: None,
            proxy_bypass: Vec::new(),
            user_data_dir: None,
            chrome_path: None,
            extension_root: PathBuf::from("tmp/extension-plugins"),
            extensions: vec!["nopecha".to_string()],
            user_agent: default_user_agent().to_string(),
            window_size: (800, 600),
            no_sandbox: false,
        }
    }
}

/// Per-OS default user agent matching the pinned Chrome build.
pub fn default_user_agent() -> &'static str {
    if cfg!(target_os = "linux") {
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36 Edg/125.0.0.0"
    } else if cfg!(target_os = "windows") {
        "Mozilla/5.0 (Windows NT 10.0; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36 Edg/125.0.0.0"
    } else {
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36 Edg/125.0.0.0"
    }
}
