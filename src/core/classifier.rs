//! 错误分类器
//!
//! 按错误信息 / 错误码中的已知子串归类（网络、超时、权限、文件系统、宿主、解析、校验），
//! 未命中任何模式的归为 SYSTEM。已经是 ErrorRecord 的错误原样返回。

use std::io;

use crate::core::{ErrorCategory, ErrorRecord, Severity};

/// 匹配顺序即优先级：网络早于超时（"etimedout" 属于网络），权限早于文件系统
const PATTERNS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Network,
        &[
            "econnrefused",
            "connection refused",
            "econnreset",
            "connection reset",
            "enotfound",
            "getaddrinfo",
            "etimedout",
            "network",
            "socket hang up",
            "dns",
        ],
    ),
    (
        ErrorCategory::Timeout,
        &["timed out", "timeout", "deadline exceeded"],
    ),
    (
        ErrorCategory::Permission,
        &[
            "eacces",
            "eperm",
            "permission denied",
            "access denied",
            "operation not permitted",
            "outside workspace",
            "blocked path",
        ],
    ),
    (
        ErrorCategory::FileSystem,
        &[
            "enoent",
            "no such file",
            "file not found",
            "enospc",
            "no space left",
            "eisdir",
            "is a directory",
            "enotdir",
            "eexist",
            "already exists",
        ],
    ),
    (
        ErrorCategory::Host,
        &[
            "host command",
            "command not found",
            "unknown command",
            "extension host",
        ],
    ),
    (
        ErrorCategory::Parsing,
        &[
            "unexpected token",
            "malformed",
            "parse",
            "syntax error",
            "invalid json",
            "expected value",
            "eof while parsing",
        ],
    ),
    (
        ErrorCategory::Validation,
        &["required", "missing field", "missing", "invalid", "must be", "empty"],
    ),
];

/// 默认建议（附在分类结果上）
fn default_suggestions(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Network => &[
            "Check network connectivity",
            "Retry after a short delay",
        ],
        ErrorCategory::Timeout => &[
            "Increase the timeout",
            "Split the operation into smaller steps",
        ],
        ErrorCategory::FileSystem => &[
            "Verify the path exists",
            "Check available disk space",
        ],
        ErrorCategory::Permission => &[
            "Check file permissions",
            "Keep paths inside the workspace root",
        ],
        ErrorCategory::Validation => &["Check the required parameters and their values"],
        ErrorCategory::Parsing => &["Return a single well-formed JSON object"],
        ErrorCategory::System => &["Inspect the logs for details"],
        ErrorCategory::Host => &["Check that the host capability is available"],
    }
}

/// 基于模式的错误分类器（无状态，可随处构造）
#[derive(Debug, Default, Clone)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// 分类任意错误：ErrorRecord 原样返回，io::Error 按 kind 分类，其余按信息子串匹配
    pub fn classify(&self, err: &anyhow::Error) -> ErrorRecord {
        if let Some(rec) = err.downcast_ref::<ErrorRecord>() {
            return rec.clone();
        }
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            // 类别按 io kind 判定，信息保留 context 链（含路径）
            let mut rec = self.classify_io(io_err);
            rec.message = format!("{err:#}");
            return rec;
        }
        self.classify_message(&format!("{err:#}"), None)
    }

    /// 根据错误信息与可选错误码分类
    pub fn classify_message(&self, message: &str, code: Option<&str>) -> ErrorRecord {
        let category = Self::category_for(message, code);
        let mut rec = ErrorRecord::new(category, message)
            .with_suggestions(default_suggestions(category).iter().copied());
        if let Some(code) = code {
            rec = rec.with_context("source_code", code);
        }
        let lower = message.to_lowercase();
        if lower.contains("no space left") || lower.contains("enospc") {
            rec = rec.with_severity(Severity::High);
        }
        if lower.contains("out of memory") || lower.contains("fatal") {
            rec = rec.with_severity(Severity::Critical);
        }
        rec
    }

    pub fn classify_io(&self, err: &io::Error) -> ErrorRecord {
        let category = match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::AlreadyExists
            | io::ErrorKind::WriteZero
            | io::ErrorKind::UnexpectedEof => ErrorCategory::FileSystem,
            io::ErrorKind::PermissionDenied => ErrorCategory::Permission,
            io::ErrorKind::TimedOut => ErrorCategory::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::BrokenPipe => ErrorCategory::Network,
            io::ErrorKind::InvalidData => ErrorCategory::Parsing,
            io::ErrorKind::InvalidInput => ErrorCategory::Validation,
            _ => Self::category_for(&err.to_string(), None),
        };
        ErrorRecord::new(category, err.to_string())
            .with_context("io_kind", format!("{:?}", err.kind()))
            .with_suggestions(default_suggestions(category).iter().copied())
    }

    fn category_for(message: &str, code: Option<&str>) -> ErrorCategory {
        let haystack = match code {
            Some(c) => format!("{} {}", c, message).to_lowercase(),
            None => message.to_lowercase(),
        };
        PATTERNS
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| haystack.contains(n)))
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::System)
    }
}
