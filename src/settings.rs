use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "refract.json";

/// One configured output destination.
///
/// Only `enabled` and `url` are interpreted by the relay; the remaining
/// fields are carried through for external configuration editors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub enabled: bool,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

impl Endpoint {
    pub fn enabled(url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            url: url.into(),
            width: None,
            height: None,
            bitrate: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Listen address for inbound publishes, `:1935` style accepted
    pub bind: String,

    /// Optional stream-key secret; mismatching publishes are rejected
    pub key: Option<String>,

    /// Configured output destinations
    pub endpoints: Vec<Endpoint>,
}

impl Settings {
    /// Resolve the endpoint list, in priority order: JSON config file,
    /// positional URL arguments, historical one-URL-per-line file. When
    /// nothing is configured an example file is written and the resolve
    /// fails, so the process exits non-zero with a pointer to edit.
    pub fn resolve(
        bind: &str,
        key: Option<String>,
        config: Option<PathBuf>,
        urls: Vec<String>,
    ) -> Result<Self> {
        let path = config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let content = fs::read_to_string(&path).ok();

        if let Some(content) = &content {
            if let Ok(endpoints) = serde_json::from_str::<Vec<Endpoint>>(content) {
                if !endpoints.is_empty() {
                    return Ok(Self::assemble(bind, key, endpoints));
                }
            }
        }

        if !urls.is_empty() {
            let endpoints = urls.into_iter().map(Endpoint::enabled).collect();
            return Ok(Self::assemble(bind, key, endpoints));
        }

        if let Some(content) = &content {
            if let Some(endpoints) = parse_url_lines(content) {
                return Ok(Self::assemble(bind, key, endpoints));
            }
            bail!(
                "config file {} contains no usable endpoints",
                path.display()
            );
        }

        write_example(&path)
            .with_context(|| format!("failed writing example config to {}", path.display()))?;
        bail!(
            "no endpoints configured; example config written to {}",
            path.display()
        );
    }

    fn assemble(bind: &str, key: Option<String>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            bind: bind.to_string(),
            key,
            endpoints,
        }
    }
}

/// `:1935` means every interface, like the historical flag format.
pub fn normalize_bind_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

/// Historical config format: one URL per line, `#` comments allowed.
fn parse_url_lines(content: &str) -> Option<Vec<Endpoint>> {
    let lines: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    if lines.is_empty() || !lines.iter().all(|l| l.contains("://")) {
        return None;
    }
    Some(lines.into_iter().map(Endpoint::enabled).collect())
}

fn write_example(path: &Path) -> Result<()> {
    let example = vec![Endpoint {
        enabled: false,
        url: "rtmp://live.example.com/app/stream-key".to_string(),
        width: None,
        height: None,
        bitrate: None,
    }];
    fs::write(path, serde_json::to_string_pretty(&example)?)?;
    Ok(())
}
