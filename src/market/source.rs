use std::path::PathBuf;

use async_trait::async_trait;

use crate::models::ResolvedAsset;
use crate::Result;

/// Boundary to the external asset-discovery collaborator: something that
/// knows which asset is currently in front of the user.
#[async_trait]
pub trait ActiveAssetSource: Send + Sync {
    /// `None` means no asset is currently resolved.
    async fn resolve(&self) -> Result<Option<ResolvedAsset>>;
}

/// Reads the resolved `{assetId, symbol}` pair from a JSON file the
/// discovery collaborator keeps up to date.
pub struct FileAssetSource {
    path: PathBuf,
}

impl FileAssetSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ActiveAssetSource for FileAssetSource {
    async fn resolve(&self) -> Result<Option<ResolvedAsset>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            // Missing file just means nothing is resolved yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if raw.trim().is_empty() {
            return Ok(None);
        }

        let resolved: ResolvedAsset = serde_json::from_str(&raw)?;
        Ok(Some(resolved))
    }
}

/// Fixed asset, for tests and offline runs.
pub struct StaticAssetSource {
    asset: Option<ResolvedAsset>,
}

impl StaticAssetSource {
    pub fn new(asset: Option<ResolvedAsset>) -> Self {
        Self { asset }
    }
}

#[async_trait]
impl ActiveAssetSource for StaticAssetSource {
    async fn resolve(&self) -> Result<Option<ResolvedAsset>> {
        Ok(self.asset.clone())
    }
}
