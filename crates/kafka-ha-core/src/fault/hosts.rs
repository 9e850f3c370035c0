//! Client-side name resolution for unit hostnames.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::Result;

const BLOCK_BEGIN: &str = "# BEGIN kafka-ha managed hosts";
const BLOCK_END: &str = "# END kafka-ha managed hosts";

/// Keeps hostnames of cluster members pointed at their current addresses.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Replace all managed entries with `(hostname, address)` pairs.
    async fn refresh(&self, entries: &[(String, String)]) -> Result<()>;

    /// Remove all managed entries; succeeds when there are none.
    async fn clear(&self) -> Result<()>;
}

/// A hosts file with one marked block owned by the harness.
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Content with the managed block removed.
fn strip_block(content: &str) -> String {
    let mut kept = Vec::new();
    let mut inside = false;
    for line in content.lines() {
        match line.trim() {
            BLOCK_BEGIN => inside = true,
            BLOCK_END => inside = false,
            _ if !inside => kept.push(line),
            _ => {}
        }
    }
    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn render_block(entries: &[(String, String)]) -> String {
    let mut block = String::new();
    block.push_str(BLOCK_BEGIN);
    block.push('\n');
    for (host, address) in entries {
        block.push_str(&format!("{} {}\n", address, host));
    }
    block.push_str(BLOCK_END);
    block.push('\n');
    block
}

#[async_trait]
impl NameResolver for HostsFile {
    async fn refresh(&self, entries: &[(String, String)]) -> Result<()> {
        let content = strip_block(&self.read().await?);
        let updated = format!("{}{}", content, render_block(entries));
        tokio::fs::write(&self.path, updated).await?;
        info!(
            "Wrote {} host entries to {}",
            entries.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let content = self.read().await?;
        let stripped = strip_block(&content);
        if stripped != content {
            tokio::fs::write(&self.path, stripped).await?;
            debug!("Removed managed hosts from {}", self.path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(address: &str) -> Vec<(String, String)> {
        vec![(
            "kafka-k8s-0.kafka-k8s-endpoints".to_string(),
            address.to_string(),
        )]
    }

    #[tokio::test]
    async fn test_refresh_replaces_managed_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        tokio::fs::write(&path, "127.0.0.1 localhost\n").await.unwrap();

        let hosts = HostsFile::new(&path);
        hosts.refresh(&entries("10.1.0.10")).await.unwrap();
        hosts.refresh(&entries("10.1.0.11")).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.starts_with("127.0.0.1 localhost\n"));
        assert!(content.contains("10.1.0.11 kafka-k8s-0.kafka-k8s-endpoints"));
        assert!(!content.contains("10.1.0.10"));
        assert_eq!(content.matches(BLOCK_BEGIN).count(), 1);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        tokio::fs::write(&path, "127.0.0.1 localhost\n").await.unwrap();

        let hosts = HostsFile::new(&path);
        hosts.refresh(&entries("10.1.0.10")).await.unwrap();
        hosts.clear().await.unwrap();
        hosts.clear().await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "127.0.0.1 localhost\n");
    }

    #[tokio::test]
    async fn test_missing_file_is_created() {
        let dir = TempDir::new().unwrap();
        let hosts = HostsFile::new(dir.path().join("hosts"));
        hosts.clear().await.unwrap();
        hosts.refresh(&entries("10.1.0.10")).await.unwrap();
        let content = tokio::fs::read_to_string(hosts.path()).await.unwrap();
        assert!(content.starts_with(BLOCK_BEGIN));
    }
}
