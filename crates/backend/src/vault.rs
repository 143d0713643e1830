//! Image vault capability.
//!
//! The vault downloads, caches and verifies base images. The daemon only
//! asks for images by query and hands back progress to the client stream.

use async_trait::async_trait;
use multipassd_common::{MemorySize, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How an image request names its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    /// A published alias such as "jammy" or "default".
    Alias,
    /// A local file path.
    LocalFile,
    /// A direct HTTP download.
    HttpDownload,
}

/// An image request issued by the daemon on behalf of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Instance the image is for; empty for searches.
    pub name: String,
    /// Image alias, file or URL.
    pub release: String,
    pub remote_name: String,
    pub query_type: QueryType,
}

impl Query {
    pub fn alias(name: impl Into<String>, release: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            release: release.into(),
            remote_name: String::new(),
            query_type: QueryType::Alias,
        }
    }
}

/// A prepared disk image for one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VMImage {
    pub image_path: PathBuf,
    pub id: String,
    pub original_release: String,
}

/// Published information about one image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VMImageInfo {
    pub os: String,
    pub release_title: String,
    pub version: String,
    pub aliases: Vec<String>,
    pub id: String,
    pub supported: bool,
}

/// Download progress callback: percentage in, keep-going out.
pub type ProgressFn<'a> = &'a (dyn Fn(i32) -> bool + Send + Sync);

/// The image vault the daemon fetches from and maintains.
#[async_trait]
pub trait ImageVault: Send + Sync {
    /// Fetch (or find in cache) the image for `query`, reporting download
    /// progress through `monitor`.
    async fn fetch_image(&self, query: &Query, monitor: ProgressFn<'_>) -> Result<VMImage>;

    /// Whether the vault holds a record for the named instance.
    async fn has_record_for(&self, name: &str) -> bool;

    /// Drop the vault record for the named instance.
    async fn remove(&self, name: &str) -> Result<()>;

    /// The minimum disk an image requires, by image id.
    async fn minimum_image_size_for(&self, id: &str) -> Result<MemorySize>;

    /// Search info for all images matching `query`, paired with their remote.
    async fn all_info_for(&self, query: &Query) -> Result<Vec<(String, VMImageInfo)>>;

    /// All images published by the given remote (or every remote when empty).
    async fn all_images(&self, remote_name: &str, allow_unsupported: bool)
        -> Result<Vec<(String, VMImageInfo)>>;

    /// Delete images whose retention period has passed.
    async fn prune_expired_images(&self) -> Result<()>;

    /// Re-download tracked images that have newer versions upstream.
    async fn update_images(&self, monitor: ProgressFn<'_>) -> Result<()>;
}
