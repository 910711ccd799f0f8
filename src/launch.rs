//! Launch handoff (C4 supplement).
//!
//! Resolves a browser executable for the configured channel and launches it
//! pointed at the extension's consent page. This is the one piece of
//! process-launching infrastructure `ensureExtensionForClient` depends on;
//! arbitrary Chrome flags, headless mode, and user-data-dir management are
//! out of scope.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;

use url::form_urlencoded;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserChannel {
    Stable,
    Beta,
    Dev,
    Canary,
}

impl FromStr for BrowserChannel {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            "dev" => Ok(Self::Dev),
            "canary" => Ok(Self::Canary),
            other => Err(RelayError::invalid_operation(format!("unknown browser channel: {other}"))),
        }
    }
}

/// Find a browser executable for `channel`. Checks `CDP_RELAY_BROWSER_PATH`
/// first, then platform-specific well-known install locations.
pub fn find_browser_executable(channel: BrowserChannel) -> Result<PathBuf> {
    if let Ok(over) = std::env::var("CDP_RELAY_BROWSER_PATH") {
        let path = PathBuf::from(over);
        if path.exists() {
            return Ok(path);
        }
    }

    for candidate in candidates(channel) {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(RelayError::executable_not_found(format!(
        "could not find a browser executable for the {channel:?} channel; set CDP_RELAY_BROWSER_PATH"
    )))
}

#[cfg(target_os = "linux")]
fn candidates(channel: BrowserChannel) -> Vec<PathBuf> {
    let names: &[&str] = match channel {
        BrowserChannel::Stable => &["google-chrome-stable", "google-chrome", "chromium-browser", "chromium"],
        BrowserChannel::Beta => &["google-chrome-beta"],
        BrowserChannel::Dev => &["google-chrome-unstable"],
        BrowserChannel::Canary => &["google-chrome-unstable"],
    };
    names.iter().map(|n| PathBuf::from("/usr/bin").join(n)).collect()
}

#[cfg(target_os = "macos")]
fn candidates(channel: BrowserChannel) -> Vec<PathBuf> {
    let app = match channel {
        BrowserChannel::Stable => "Google Chrome",
        BrowserChannel::Beta => "Google Chrome Beta",
        BrowserChannel::Dev => "Google Chrome Dev",
        BrowserChannel::Canary => "Google Chrome Canary",
    };
    vec![PathBuf::from("/Applications")
        .join(format!("{app}.app"))
        .join("Contents/MacOS")
        .join(app)]
}

#[cfg(target_os = "windows")]
fn candidates(channel: BrowserChannel) -> Vec<PathBuf> {
    let dir = match channel {
        BrowserChannel::Stable => "Google\\Chrome\\Application\\chrome.exe",
        BrowserChannel::Beta => "Google\\Chrome Beta\\Application\\chrome.exe",
        BrowserChannel::Dev => "Google\\Chrome Dev\\Application\\chrome.exe",
        BrowserChannel::Canary => "Google\\Chrome SxS\\Application\\chrome.exe",
    };
    let mut paths = Vec::new();
    if let Ok(pf) = std::env::var("PROGRAMFILES") {
        paths.push(PathBuf::from(pf).join(dir));
    }
    if let Ok(pf) = std::env::var("LOCALAPPDATA") {
        paths.push(PathBuf::from(pf).join(dir));
    }
    paths
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn candidates(_channel: BrowserChannel) -> Vec<PathBuf> {
    Vec::new()
}

/// Build the extension consent/handoff URL the browser is launched with
/// (spec §6, "Launch handoff").
pub fn build_handoff_url(extension_id: &str, relay_ws_url: &str, client: &str) -> String {
    let relay_encoded: String = form_urlencoded::byte_serialize(relay_ws_url.as_bytes()).collect();
    let client_encoded: String = form_urlencoded::byte_serialize(client.as_bytes()).collect();
    format!("chrome-extension://{extension_id}/connect.html?mcpRelayUrl={relay_encoded}&client={client_encoded}")
}

/// A handle to the launched browser process. Killed on drop unless detached.
pub struct BrowserProcess {
    child: Option<Child>,
}

impl BrowserProcess {
    pub fn pid(&self) -> u32 {
        self.child.as_ref().map_or(0, Child::id)
    }

    /// Detach the process so it outlives this handle.
    pub fn detach(mut self) -> u32 {
        let pid = self.pid();
        self.child = None;
        pid
    }
}

impl Drop for BrowserProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Launch the resolved browser executable pointed at the handoff URL.
pub fn launch_browser(executable: &Path, handoff_url: &str) -> Result<BrowserProcess> {
    let child = Command::new(executable)
        .arg(handoff_url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(BrowserProcess { child: Some(child) })
}
