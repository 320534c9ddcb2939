use std::path::Path;

use serde::{Deserialize, Serialize};

/// Smallest copy buffer accepted for archive streaming.
pub const MIN_COPY_BUFFER_SIZE: usize = 4 * 1024;

/// Server configuration, resolved once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// URL prefix the handler is mounted at (e.g. `/files`)
    #[serde(default = "default_route")]
    pub route: String,

    /// Accept multipart uploads into directories
    #[serde(default)]
    pub allow_upload: bool,

    /// Accept DELETE (or `_method=DELETE` form posts) on files
    #[serde(default)]
    pub allow_delete: bool,

    /// Page title of directory listings
    #[serde(default = "default_title")]
    pub title: String,

    /// Maximum file size for uploads (in bytes, 0 = unlimited)
    #[serde(default)]
    pub max_upload_size: u64,

    /// Copy buffer used per archive job (in bytes)
    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,
}

fn default_route() -> String {
    "/".to_string()
}

fn default_title() -> String {
    "HTTP File Server".to_string()
}

fn default_copy_buffer_size() -> usize {
    64 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            route: default_route(),
            allow_upload: false,
            allow_delete: false,
            title: default_title(),
            max_upload_size: 0,
            copy_buffer_size: default_copy_buffer_size(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Mount point with a single leading `/` and no trailing `/`.
    ///
    /// The root mount is the empty string.
    pub fn mount_point(&self) -> String {
        normalize_mount(&self.route)
    }

    pub fn copy_buffer_size(&self) -> usize {
        self.copy_buffer_size.max(MIN_COPY_BUFFER_SIZE)
    }

    pub fn upload_limit(&self) -> Option<u64> {
        (self.max_upload_size > 0).then_some(self.max_upload_size)
    }
}

pub fn normalize_mount(route: &str) -> String {
    let trimmed = route.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}
