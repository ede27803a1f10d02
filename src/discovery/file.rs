//! Queue list read from a text file.
//!
//! The file is read again on every enumeration so the list can be edited
//! while the bridge runs.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use super::{DiscoveryError, QueueInformationProvider, Result};

/// Lists the queues named in a file, one per line.
///
/// Blank lines and lines starting with `#` are ignored.
pub struct FileQueueInformationProvider {
    path: PathBuf,
    existence: Option<Arc<dyn QueueInformationProvider>>,
}

impl FileQueueInformationProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            existence: None,
        }
    }

    /// Ask the broker whether a listed queue exists instead of trusting
    /// the file.
    pub fn with_existence(mut self, provider: Arc<dyn QueueInformationProvider>) -> Self {
        self.existence = Some(provider);
        self
    }

    async fn read(&self) -> Result<Vec<String>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| DiscoveryError::File {
                path: self.path.display().to_string(),
                message: e.to_string(),
            })?;

        let queues: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();

        debug!(path = %self.path.display(), count = queues.len(), "Read queue file");
        Ok(queues)
    }
}

#[async_trait]
impl QueueInformationProvider for FileQueueInformationProvider {
    fn queues(&self) -> BoxStream<'_, Result<String>> {
        stream::once(self.read())
            .flat_map(|result| {
                let items: Vec<Result<String>> = match result {
                    Ok(queues) => queues.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed()
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        match &self.existence {
            Some(provider) => provider.exists(name).await,
            None => Ok(self.read().await?.iter().any(|queue| queue == name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::io::Write;

    #[tokio::test]
    async fn test_reads_queue_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "orders_error\n\n# archived\n  billing_error  ").unwrap();

        let provider = FileQueueInformationProvider::new(file.path());
        let queues: Vec<String> = provider.queues().try_collect().await.unwrap();

        assert_eq!(queues, vec!["orders_error", "billing_error"]);
        assert!(provider.exists("billing_error").await.unwrap());
        assert!(!provider.exists("archived").await.unwrap());
    }

    #[tokio::test]
    async fn test_rereads_file_each_call() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "orders_error\n").unwrap();
        let provider = FileQueueInformationProvider::new(file.path());

        let first: Vec<String> = provider.queues().try_collect().await.unwrap();
        std::fs::write(file.path(), "orders_error\nshipping_error\n").unwrap();
        let second: Vec<String> = provider.queues().try_collect().await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let provider = FileQueueInformationProvider::new("/nonexistent/queues.txt");
        let result: Result<Vec<String>> = provider.queues().try_collect().await;

        assert!(matches!(result, Err(DiscoveryError::File { .. })));
    }
}
