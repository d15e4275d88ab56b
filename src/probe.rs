//! Media server connectivity check.
//!
//! Before a run the session asks a [`ConnectivityCheck`] whether the media
//! server is reachable. The session only cares about success or failure;
//! the summary lines are shown to the operator. [`HttpProbe`] is the real
//! implementation, talking to a Jellyfin-compatible API.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

const TOKEN_HEADER: &str = "X-Emby-Token";
const INFO_PATH: &str = "/System/Info";
const ENCODING_PATH: &str = "/System/Configuration/encoding";

/// Pre-flight check against the media server.
pub trait ConnectivityCheck: Send + Sync {
    /// Returns lines describing the server on success.
    fn check_connection(&self, endpoint: &str, credential: &str) -> Result<Vec<String>>;
}

/// Server identity from `/System/Info`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SystemInfo {
    #[serde(default)]
    server_name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// The parts of the encoding configuration the benchmark depends on.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct EncodingSummary {
    #[serde(default)]
    pub hardware_acceleration_type: Option<String>,
    #[serde(default)]
    pub vaapi_device: Option<String>,
    #[serde(default)]
    pub qsv_device: Option<String>,
}

impl EncodingSummary {
    pub fn lines(&self) -> Vec<String> {
        let show = |value: &Option<String>, missing: &str| {
            value
                .as_deref()
                .filter(|v| !v.is_empty())
                .unwrap_or(missing)
                .to_string()
        };
        vec![
            format!(
                "Hardware Acceleration Type: {}",
                show(&self.hardware_acceleration_type, "None")
            ),
            format!("VAAPI Device: {}", show(&self.vaapi_device, "N/A")),
            format!("QSV Device: {}", show(&self.qsv_device, "N/A")),
        ]
    }
}

/// Blocking HTTP probe.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn get<T: for<'de> Deserialize<'de>>(&self, url: &str, credential: &str) -> Result<T> {
        debug!(url, "probing media server");
        let response = ureq::get(url)
            .set(TOKEN_HEADER, credential)
            .timeout(self.timeout)
            .call()
            .with_context(|| format!("request to {url} failed"))?;
        response
            .into_json()
            .with_context(|| format!("invalid JSON from {url}"))
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ConnectivityCheck for HttpProbe {
    fn check_connection(&self, endpoint: &str, credential: &str) -> Result<Vec<String>> {
        let info: SystemInfo = self.get(&join_url(endpoint, INFO_PATH), credential)?;
        info!(
            server = info.server_name.as_deref().unwrap_or("unknown"),
            version = info.version.as_deref().unwrap_or("unknown"),
            "connected to media server"
        );

        let encoding: EncodingSummary =
            self.get(&join_url(endpoint, ENCODING_PATH), credential)?;

        let mut lines = vec![
            "Connected to media server successfully.".to_string(),
            "Transcoding configuration retrieved.".to_string(),
        ];
        lines.extend(encoding.lines());
        Ok(lines)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim_end_matches('/'))
}
