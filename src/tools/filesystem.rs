//! 本地文件系统适配器
//!
//! LocalFileAdapter 绑定 WorkspacePolicy，每次操作前先做路径（根目录内、非阻止模式）与大小校验，
//! 已存在的路径再 canonicalize 复核一次，防止符号链接逃逸；通过校验后才用 tokio::fs 执行。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::core::ErrorRecord;
use crate::tools::{FileCapability, WorkspacePolicy};

/// 本地文件能力：所有路径经 WorkspacePolicy 校验
#[derive(Debug, Clone)]
pub struct LocalFileAdapter {
    policy: Arc<WorkspacePolicy>,
}

impl LocalFileAdapter {
    pub fn new(policy: Arc<WorkspacePolicy>) -> Self {
        Self { policy }
    }

    /// 词法校验 + 已存在路径的符号链接复核
    fn guard(&self, path: &str) -> Result<PathBuf, ErrorRecord> {
        let resolved = self.policy.check_path(path)?;
        if let Ok(canonical) = resolved.canonicalize() {
            if !canonical.starts_with(self.policy.root()) {
                return Err(ErrorRecord::permission(format!(
                    "Path '{path}' resolves outside workspace root"
                ))
                .with_code("PATH_OUTSIDE_WORKSPACE")
                .non_retryable());
            }
            self.policy.check_blocked(&canonical)?;
        }
        Ok(resolved)
    }

    async fn ensure_parent(path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileCapability for LocalFileAdapter {
    async fn read(&self, path: &str) -> anyhow::Result<String> {
        let resolved = self.guard(path)?;
        let meta = tokio::fs::metadata(&resolved)
            .await
            .with_context(|| format!("read {path}"))?;
        self.policy.check_size(meta.len())?;
        tracing::info!(path = %path, "file read");
        tokio::fs::read_to_string(&resolved)
            .await
            .with_context(|| format!("read {path}"))
    }

    async fn write(&self, path: &str, content: &str) -> anyhow::Result<u64> {
        let resolved = self.guard(path)?;
        self.policy.check_size(content.len() as u64)?;
        Self::ensure_parent(&resolved).await?;
        tokio::fs::write(&resolved, content)
            .await
            .with_context(|| format!("write {path}"))?;
        tracing::info!(path = %path, bytes = content.len(), "file written");
        Ok(content.len() as u64)
    }

    async fn append(&self, path: &str, content: &str) -> anyhow::Result<u64> {
        let resolved = self.guard(path)?;
        let existing = match tokio::fs::metadata(&resolved).await {
            Ok(m) => m.len(),
            Err(_) => 0,
        };
        self.policy
            .check_size(existing.saturating_add(content.len() as u64))?;
        Self::ensure_parent(&resolved).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&resolved)
            .await
            .with_context(|| format!("append {path}"))?;
        file.write_all(content.as_bytes())
            .await
            .with_context(|| format!("append {path}"))?;
        file.flush().await?;
        Ok(content.len() as u64)
    }

    async fn create(&self, path: &str, content: &str) -> anyhow::Result<u64> {
        let resolved = self.guard(path)?;
        self.policy.check_size(content.len() as u64)?;
        Self::ensure_parent(&resolved).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&resolved)
            .await
            .with_context(|| format!("create {path}"))?;
        file.write_all(content.as_bytes())
            .await
            .with_context(|| format!("create {path}"))?;
        file.flush().await?;
        tracing::info!(path = %path, bytes = content.len(), "file created");
        Ok(content.len() as u64)
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        let resolved = self.guard(path)?;
        if resolved == self.policy.root() {
            return Err(ErrorRecord::permission("Refusing to delete the workspace root")
                .with_code("PATH_OUTSIDE_WORKSPACE")
                .non_retryable()
                .into());
        }
        tokio::fs::remove_file(&resolved)
            .await
            .with_context(|| format!("delete {path}"))?;
        tracing::info!(path = %path, "file deleted");
        Ok(())
    }

    async fn list(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let base = if path.trim().is_empty() || path.trim() == "." {
            self.policy.root().to_path_buf()
        } else {
            self.guard(path)?
        };
        let mut dir = tokio::fs::read_dir(&base)
            .await
            .with_context(|| format!("list {path}"))?;
        let mut entries = Vec::new();
        while let Some(e) = dir.next_entry().await? {
            let name = e.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || self.policy.is_blocked(&e.path()) {
                continue;
            }
            let ty = if e.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                "/"
            } else {
                ""
            };
            entries.push(format!("{}{}", name, ty));
        }
        entries.sort();
        Ok(entries)
    }

    async fn search(&self, pattern: &str, max_results: usize) -> anyhow::Result<Vec<String>> {
        let glob = glob::Pattern::new(pattern)
            .map_err(|e| ErrorRecord::validation(format!("Invalid search pattern '{pattern}': {e}")))?;
        let policy = self.policy.clone();
        let matches = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            for entry in walkdir::WalkDir::new(policy.root())
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| !policy.is_blocked(e.path()))
                .filter_map(Result::ok)
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = policy.relative(entry.path());
                let name = entry.file_name().to_string_lossy();
                if glob.matches(&rel) || glob.matches(&name) {
                    found.push(rel);
                    if found.len() >= max_results {
                        break;
                    }
                }
            }
            found.sort();
            found
        })
        .await
        .context("search task panicked")?;
        Ok(matches)
    }
}
