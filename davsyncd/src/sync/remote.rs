use std::path::Path;

use async_trait::async_trait;
use davsync_core::{DavClient, DavError, ResourceType};

use super::reconcile::EntryType;

/// Child of a remote directory as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub entry_type: EntryType,
    pub etag: Option<String>,
}

/// Remote capabilities the engine consumes. Paths are relative to the
/// configured remote root and use `/` separators.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, DavError>;

    async fn change_tag(&self, path: &str) -> Result<Option<String>, DavError>;

    async fn download(&self, path: &str, target: &Path) -> Result<(), DavError>;

    async fn upload(&self, source: &Path, path: &str) -> Result<Option<String>, DavError>;

    async fn create_directory(&self, path: &str) -> Result<(), DavError>;

    async fn delete(&self, path: &str) -> Result<(), DavError>;
}

#[async_trait]
impl RemoteStore for DavClient {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, DavError> {
        Ok(self
            .list_directory(path)
            .await?
            .into_iter()
            .map(|resource| RemoteEntry {
                name: resource.name,
                entry_type: match resource.resource_type {
                    ResourceType::File => EntryType::File,
                    ResourceType::Dir => EntryType::Directory,
                },
                etag: resource.etag,
            })
            .collect())
    }

    async fn change_tag(&self, path: &str) -> Result<Option<String>, DavError> {
        self.etag(path).await
    }

    async fn download(&self, path: &str, target: &Path) -> Result<(), DavError> {
        self.download_to_path(path, target).await
    }

    async fn upload(&self, source: &Path, path: &str) -> Result<Option<String>, DavError> {
        self.upload_from_path(source, path).await
    }

    async fn create_directory(&self, path: &str) -> Result<(), DavError> {
        self.create_folder(path).await
    }

    async fn delete(&self, path: &str) -> Result<(), DavError> {
        self.delete_resource(path).await
    }
}
