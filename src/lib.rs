//! HTTP view of a directory tree.
//!
//! A single handler lists directories, streams files, builds zip and tar.gz
//! downloads of a subtree on the fly, and optionally accepts uploads and
//! deletions. It can be used as a standalone binary or embedded in another
//! application via [`routes::app`].

pub mod archive;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod listing;
pub mod render;
pub mod resolve;
pub mod routes;

use std::path::PathBuf;
use std::sync::Arc;

pub use config::Config;
pub use error::FileServerError;

use dispatch::Capabilities;
use render::{ListingRenderer, TeraRenderer};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Root directory to serve files from
    pub root_dir: PathBuf,
    /// Normalized mount point (`""` when mounted at `/`)
    pub mount: Arc<str>,
    /// Configuration
    pub config: Arc<Config>,
    /// Listing page renderer, built once
    pub renderer: Arc<dyn ListingRenderer>,
}

impl AppState {
    /// Create a new AppState with the given root directory and default config.
    pub fn new(root_dir: PathBuf) -> Result<Self, FileServerError> {
        Self::with_config(root_dir, Config::default())
    }

    /// Create a new AppState with the given root directory and config.
    pub fn with_config(root_dir: PathBuf, config: Config) -> Result<Self, FileServerError> {
        Ok(Self {
            root_dir,
            mount: config.mount_point().into(),
            config: Arc::new(config),
            renderer: Arc::new(TeraRenderer::new()?),
        })
    }

    /// Replace the listing renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn ListingRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            allow_upload: self.config.allow_upload,
            allow_delete: self.config.allow_delete,
        }
    }
}
