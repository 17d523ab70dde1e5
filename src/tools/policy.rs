//! 工作区安全策略
//!
//! 纯词法检查，不触碰文件系统（符号链接由文件适配器在操作前再 canonicalize 复核）：
//! - 路径必须落在工作区根目录内（禁止 ../ 逃逸与根外绝对路径）
//! - 路径不得命中阻止模式（子串或 glob 通配）
//! - 写入内容不得超过大小上限

use std::path::{Component, Path, PathBuf};

use crate::core::{ErrorRecord, Severity};

/// 默认阻止模式
pub fn default_blocked_patterns() -> Vec<String> {
    vec![
        ".git/".into(),
        ".env".into(),
        "*.pem".into(),
        "*.key".into(),
        "id_rsa".into(),
    ]
}

#[derive(Debug, Clone)]
pub struct WorkspacePolicy {
    root: PathBuf,
    blocked_patterns: Vec<BlockedPattern>,
    max_file_size: u64,
}

#[derive(Debug, Clone)]
enum BlockedPattern {
    Substring(String),
    Glob(glob::Pattern),
}

impl BlockedPattern {
    fn parse(raw: &str) -> Self {
        if raw.contains(['*', '?', '[']) {
            match glob::Pattern::new(raw) {
                Ok(p) => return BlockedPattern::Glob(p),
                Err(e) => {
                    tracing::warn!(pattern = %raw, error = %e, "invalid glob, matching as substring");
                }
            }
        }
        BlockedPattern::Substring(raw.to_string())
    }

    fn matches(&self, relative: &str) -> bool {
        match self {
            BlockedPattern::Substring(s) => relative.contains(s.as_str()),
            BlockedPattern::Glob(p) => {
                p.matches(relative)
                    || relative
                        .rsplit('/')
                        .next()
                        .is_some_and(|name| p.matches(name))
            }
        }
    }

    fn as_str(&self) -> &str {
        match self {
            BlockedPattern::Substring(s) => s,
            BlockedPattern::Glob(p) => p.as_str(),
        }
    }
}

/// 词法规范化：去掉 `.`，折叠 `..`；返回 None 表示 `..` 越过了文件系统根
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(c) => out.push(c),
        }
    }
    Some(out)
}

fn outside(path: &str) -> ErrorRecord {
    ErrorRecord::permission(format!("Path '{path}' is outside workspace root"))
        .with_code("PATH_OUTSIDE_WORKSPACE")
        .with_severity(Severity::High)
        .with_context("path", path)
        .with_suggestion("Use a path relative to the workspace root")
        .non_retryable()
}

impl WorkspacePolicy {
    pub fn new(root: impl AsRef<Path>, blocked_patterns: &[String], max_file_size: u64) -> Self {
        let root = root.as_ref().to_path_buf();
        let root = root.canonicalize().unwrap_or(root);
        let root = normalize(&root).unwrap_or(root);
        Self {
            root,
            blocked_patterns: blocked_patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| BlockedPattern::parse(p.trim()))
                .collect(),
            max_file_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// 解析为工作区内的绝对路径；越界时返回不可重试的 PERMISSION 错误
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ErrorRecord> {
        let trimmed = path.trim();
        let candidate = Path::new(trimmed);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = normalize(&joined).ok_or_else(|| outside(trimmed))?;
        if !normalized.starts_with(&self.root) {
            return Err(outside(trimmed));
        }
        Ok(normalized)
    }

    /// 相对根目录的路径（统一为 `/` 分隔），用于模式匹配与展示
    pub fn relative(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.root)
            .unwrap_or(absolute)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn check_blocked(&self, absolute: &Path) -> Result<(), ErrorRecord> {
        let relative = self.relative(absolute);
        let with_dir = format!("{relative}/");
        if let Some(p) = self
            .blocked_patterns
            .iter()
            .find(|p| p.matches(&relative) || p.matches(&with_dir))
        {
            return Err(ErrorRecord::permission(format!(
                "Access to blocked path '{relative}' is denied"
            ))
            .with_code("PATH_BLOCKED")
            .with_context("path", relative.clone())
            .with_context("pattern", p.as_str())
            .with_suggestion("Choose a file that is not protected by the workspace policy")
            .non_retryable());
        }
        Ok(())
    }

    /// resolve + check_blocked
    pub fn check_path(&self, path: &str) -> Result<PathBuf, ErrorRecord> {
        let resolved = self.resolve(path)?;
        self.check_blocked(&resolved)?;
        Ok(resolved)
    }

    pub fn is_blocked(&self, absolute: &Path) -> bool {
        self.check_blocked(absolute).is_err()
    }

    pub fn check_size(&self, len: u64) -> Result<(), ErrorRecord> {
        if len > self.max_file_size {
            return Err(ErrorRecord::validation(format!(
                "Content size {len} bytes exceeds the limit of {} bytes",
                self.max_file_size
            ))
            .with_code("CONTENT_TOO_LARGE")
            .with_suggestion("Split the content into smaller files"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorCategory;

    fn policy() -> WorkspacePolicy {
        WorkspacePolicy::new("/workspace/project", &default_blocked_patterns(), 1024)
    }

    #[test]
    fn test_resolve_inside_root() {
        let p = policy();
        let resolved = p.resolve("src/./lib.rs").unwrap();
        assert_eq!(resolved, PathBuf::from("/workspace/project/src/lib.rs"));
        assert!(p.resolve("src/../README.md").is_ok());
        assert!(p.resolve("/workspace/project/notes.md").is_ok());
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let p = policy();
        for path in ["../secret", "src/../../other", "/etc/passwd", "/workspace/project2/x"] {
            let err = p.resolve(path).unwrap_err();
            assert_eq!(err.category, ErrorCategory::Permission, "{path}");
            assert!(!err.retryable);
        }
    }

    #[test]
    fn test_blocked_patterns() {
        let p = policy();
        for path in [".git/config", "certs/server.pem", "config/.env", ".git"] {
            let abs = p.resolve(path).unwrap();
            let err = p.check_blocked(&abs).unwrap_err();
            assert_eq!(err.code, "PATH_BLOCKED", "{path}");
        }
        let ok = p.resolve("src/main.rs").unwrap();
        assert!(p.check_blocked(&ok).is_ok());
    }

    #[test]
    fn test_size_limit() {
        let p = policy();
        assert!(p.check_size(1024).is_ok());
        assert_eq!(p.check_size(1025).unwrap_err().category, ErrorCategory::Validation);
    }
}
