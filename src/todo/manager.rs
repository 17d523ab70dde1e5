//! TODO 生命周期管理
//!
//! TodoManager 是 TODO 集合的唯一修改者：创建时校验（非空、长度上限、id 唯一），
//! 状态迁移只允许单向前进，done / failed → pending 只能经由 reset_for_retry（有次数上限）。
//! 所有校验先于修改，失败时集合保持不变。

use chrono::Utc;

use crate::core::ErrorRecord;
use crate::todo::{Todo, TodoStatus, ToolCallRecord};

/// TODO 校验与重试限制
#[derive(Debug, Clone, Copy)]
pub struct TodoLimits {
    pub max_description_len: usize,
    pub max_retries: u32,
}

impl Default for TodoLimits {
    fn default() -> Self {
        Self {
            max_description_len: 500,
            max_retries: 3,
        }
    }
}

/// 按插入顺序保存的 TODO 集合
#[derive(Debug, Clone, Default)]
pub struct TodoManager {
    todos: Vec<Todo>,
    limits: TodoLimits,
    next_seq: u64,
}

fn not_found(id: &str) -> ErrorRecord {
    ErrorRecord::validation(format!("TODO '{id}' not found"))
        .with_code("TODO_NOT_FOUND")
        .with_context("todo_id", id)
        .with_suggestion("Use an id from the current TODO list")
}

impl TodoManager {
    pub fn new(limits: TodoLimits) -> Self {
        Self {
            todos: Vec::new(),
            limits,
            next_seq: 0,
        }
    }

    pub fn limits(&self) -> TodoLimits {
        self.limits
    }

    fn validate_new(
        &self,
        description: &str,
        expected_result: &str,
        id: Option<&str>,
    ) -> Result<(), ErrorRecord> {
        if description.trim().is_empty() {
            return Err(ErrorRecord::validation("TODO description must not be empty")
                .with_code("TODO_INVALID"));
        }
        if expected_result.trim().is_empty() {
            return Err(ErrorRecord::validation("TODO expected result must not be empty")
                .with_code("TODO_INVALID"));
        }
        let len = description.chars().count();
        if len > self.limits.max_description_len {
            return Err(ErrorRecord::validation(format!(
                "TODO description is {len} characters, limit is {}",
                self.limits.max_description_len
            ))
            .with_code("TODO_INVALID")
            .with_suggestion("Shorten the description or split the TODO"));
        }
        if let Some(id) = id {
            if id.trim().is_empty() {
                return Err(ErrorRecord::validation("TODO id must not be empty")
                    .with_code("TODO_INVALID"));
            }
            if self.get(id).is_some() {
                return Err(ErrorRecord::validation(format!("TODO id '{id}' already exists"))
                    .with_code("TODO_DUPLICATE_ID")
                    .with_context("todo_id", id));
            }
        }
        Ok(())
    }

    fn generate_id(&mut self) -> String {
        loop {
            self.next_seq += 1;
            let id = format!("todo_{}", self.next_seq);
            if self.get(&id).is_none() {
                return id;
            }
        }
    }

    /// 创建 TODO；id 可由调用方提供，否则自动生成
    pub fn create(
        &mut self,
        description: &str,
        expected_result: &str,
        id: Option<&str>,
    ) -> Result<Todo, ErrorRecord> {
        // 查重与存储使用同一个去空白后的 id
        let id = id.map(str::trim);
        self.validate_new(description, expected_result, id)?;
        let id = match id {
            Some(id) => id.to_string(),
            None => self.generate_id(),
        };
        let todo = Todo::new(
            id,
            description.trim().to_string(),
            expected_result.trim().to_string(),
        );
        tracing::debug!(todo_id = %todo.id, "todo created");
        self.todos.push(todo.clone());
        Ok(todo)
    }

    pub fn get(&self, id: &str) -> Option<&Todo> {
        self.todos.iter().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Todo, ErrorRecord> {
        self.todos
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| not_found(id))
    }

    /// 普通状态迁移；重置请用 reset_for_retry
    pub fn update_status(&mut self, id: &str, status: TodoStatus) -> Result<Todo, ErrorRecord> {
        let todo = self.get_mut(id)?;
        if todo.status == status {
            return Ok(todo.clone());
        }
        if !todo.status.can_transition_to(status) {
            return Err(ErrorRecord::validation(format!(
                "illegal TODO transition {} -> {} for '{}'",
                todo.status.as_str(),
                status.as_str(),
                id
            ))
            .with_code("TODO_TRANSITION")
            .with_context("todo_id", id));
        }
        todo.status = status;
        if status.is_terminal() {
            todo.completed_at = Some(Utc::now());
        }
        Ok(todo.clone())
    }

    pub fn mark_in_progress(&mut self, id: &str) -> Result<Todo, ErrorRecord> {
        self.update_status(id, TodoStatus::InProgress)
    }

    /// 标记完成；pending 的 TODO 先进入 in_progress，保证迁移路径合法
    pub fn mark_complete(&mut self, id: &str, result: &str) -> Result<Todo, ErrorRecord> {
        self.finish(id, TodoStatus::Done, result)
    }

    pub fn mark_failed(&mut self, id: &str, reason: &str) -> Result<Todo, ErrorRecord> {
        self.finish(id, TodoStatus::Failed, reason)
    }

    fn finish(&mut self, id: &str, status: TodoStatus, text: &str) -> Result<Todo, ErrorRecord> {
        let current = self.get(id).ok_or_else(|| not_found(id))?.status;
        if current == TodoStatus::Pending {
            self.update_status(id, TodoStatus::InProgress)?;
        }
        self.update_status(id, status)?;
        let todo = self.get_mut(id)?;
        todo.result = Some(text.to_string());
        Ok(todo.clone())
    }

    /// 校验被拒后的重试重置：done / failed → pending，超过次数上限时拒绝
    pub fn reset_for_retry(&mut self, id: &str) -> Result<Todo, ErrorRecord> {
        let max_retries = self.limits.max_retries;
        let todo = self.get_mut(id)?;
        if !todo.status.is_terminal() {
            return Err(ErrorRecord::validation(format!(
                "TODO '{}' is {} and cannot be reset",
                id,
                todo.status.as_str()
            ))
            .with_code("TODO_TRANSITION"));
        }
        if todo.retry_count >= max_retries {
            return Err(ErrorRecord::validation(format!(
                "TODO '{id}' exhausted its {max_retries} retries"
            ))
            .with_code("TODO_RETRY_EXHAUSTED")
            .with_context("todo_id", id));
        }
        todo.retry_count += 1;
        todo.status = TodoStatus::Pending;
        todo.result = None;
        todo.completed_at = None;
        Ok(todo.clone())
    }

    pub fn retries_left(&self, id: &str) -> u32 {
        self.get(id)
            .map(|t| self.limits.max_retries.saturating_sub(t.retry_count))
            .unwrap_or(0)
    }

    pub fn attach_tool_call(&mut self, id: &str, record: ToolCallRecord) -> Result<(), ErrorRecord> {
        self.get_mut(id)?.tool_calls.push(record);
        Ok(())
    }

    pub fn list(&self) -> &[Todo] {
        &self.todos
    }

    pub fn list_by_status(&self, status: TodoStatus) -> Vec<&Todo> {
        self.todos.iter().filter(|t| t.status == status).collect()
    }

    /// 插入顺序中的第一个 pending
    pub fn next_pending(&self) -> Option<&Todo> {
        self.todos.iter().find(|t| t.status == TodoStatus::Pending)
    }

    /// 当前正在执行的 TODO（第一个 in_progress）
    pub fn current(&self) -> Option<&Todo> {
        self.todos.iter().find(|t| t.status == TodoStatus::InProgress)
    }

    /// 是否还没有任何 TODO 开始执行
    pub fn is_untouched(&self) -> bool {
        self.todos.iter().all(|t| t.status == TodoStatus::Pending)
    }

    pub fn all_finished(&self) -> bool {
        !self.todos.is_empty() && self.todos.iter().all(|t| t.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.todos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.todos.is_empty()
    }

    pub fn clear_all(&mut self) {
        self.todos.clear();
    }

    /// 导出快照（会话持久化用）
    pub fn export(&self) -> Vec<Todo> {
        self.todos.clone()
    }

    /// 导入快照，替换当前集合；快照内 id 重复或字段为空时拒绝且不修改
    pub fn import(&mut self, snapshot: Vec<Todo>) -> Result<(), ErrorRecord> {
        let mut seen = std::collections::HashSet::new();
        for todo in &snapshot {
            if todo.description.trim().is_empty() || todo.expected_result.trim().is_empty() {
                return Err(ErrorRecord::validation(format!(
                    "imported TODO '{}' has empty fields",
                    todo.id
                ))
                .with_code("TODO_INVALID"));
            }
            if !seen.insert(todo.id.as_str()) {
                return Err(ErrorRecord::validation(format!(
                    "imported TODO id '{}' is duplicated",
                    todo.id
                ))
                .with_code("TODO_DUPLICATE_ID"));
            }
        }
        self.todos = snapshot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorCategory;

    fn manager() -> TodoManager {
        TodoManager::new(TodoLimits::default())
    }

    #[test]
    fn test_create_generates_ids() {
        let mut m = manager();
        let a = m.create("read config", "config loaded", None).unwrap();
        let b = m.create("write report", "report written", None).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, TodoStatus::Pending);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_create_validation_does_not_mutate() {
        let mut m = manager();
        m.create("first", "ok", Some("t1")).unwrap();

        for (desc, expected, id) in [
            ("", "ok", None),
            ("desc", "  ", None),
            ("dup", "ok", Some("t1")),
        ] {
            let err = m.create(desc, expected, id).unwrap_err();
            assert_eq!(err.category, ErrorCategory::Validation);
        }
        let long = "x".repeat(501);
        assert_eq!(
            m.create(&long, "ok", None).unwrap_err().category,
            ErrorCategory::Validation
        );
        assert_eq!(m.len(), 1);
        assert_eq!(m.list()[0].id, "t1");
    }

    #[test]
    fn test_padded_duplicate_id_rejected() {
        let mut m = manager();
        m.create("first", "ok", Some("t1")).unwrap();
        let err = m.create("second", "ok", Some(" t1")).unwrap_err();
        assert_eq!(err.code, "TODO_DUPLICATE_ID");
        assert_eq!(m.len(), 1);

        let padded = m.create("third", "ok", Some("  t2 ")).unwrap();
        assert_eq!(padded.id, "t2");
        assert!(m.create("fourth", "ok", Some("t2")).is_err());
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_generated_id_skips_explicit_collision() {
        let mut m = manager();
        m.create("explicit", "ok", Some("todo_1")).unwrap();
        let generated = m.create("generated", "ok", None).unwrap();
        assert_eq!(generated.id, "todo_2");
    }

    #[test]
    fn test_forward_transitions_only() {
        let mut m = manager();
        m.create("a", "ok", Some("a")).unwrap();
        assert!(m.update_status("a", TodoStatus::Done).is_err());
        m.mark_in_progress("a").unwrap();
        assert!(m.update_status("a", TodoStatus::Pending).is_err());
        let done = m.mark_complete("a", "finished").unwrap();
        assert_eq!(done.status, TodoStatus::Done);
        assert!(done.completed_at.is_some());
        assert!(m.update_status("a", TodoStatus::InProgress).is_err());
        assert!(m.mark_failed("a", "late failure").is_err());
    }

    #[test]
    fn test_mark_complete_from_pending_passes_through_in_progress() {
        let mut m = manager();
        m.create("a", "ok", Some("a")).unwrap();
        let done = m.mark_complete("a", "File a.txt created successfully").unwrap();
        assert_eq!(done.status, TodoStatus::Done);
        assert_eq!(done.result.as_deref(), Some("File a.txt created successfully"));
    }

    #[test]
    fn test_reset_for_retry_is_bounded() {
        let mut m = TodoManager::new(TodoLimits {
            max_description_len: 100,
            max_retries: 2,
        });
        m.create("a", "ok", Some("a")).unwrap();
        assert!(m.reset_for_retry("a").is_err(), "pending cannot be reset");
        for _ in 0..2 {
            m.mark_failed("a", "rejected").unwrap();
            let reset = m.reset_for_retry("a").unwrap();
            assert_eq!(reset.status, TodoStatus::Pending);
            assert!(reset.result.is_none());
        }
        m.mark_failed("a", "rejected again").unwrap();
        let err = m.reset_for_retry("a").unwrap_err();
        assert_eq!(err.code, "TODO_RETRY_EXHAUSTED");
        assert_eq!(m.get("a").unwrap().status, TodoStatus::Failed);
        assert_eq!(m.retries_left("a"), 0);
    }

    #[test]
    fn test_next_pending_and_current() {
        let mut m = manager();
        m.create("a", "ok", Some("a")).unwrap();
        m.create("b", "ok", Some("b")).unwrap();
        assert_eq!(m.next_pending().unwrap().id, "a");
        m.mark_in_progress("a").unwrap();
        assert_eq!(m.current().unwrap().id, "a");
        assert_eq!(m.next_pending().unwrap().id, "b");
        assert_eq!(m.list_by_status(TodoStatus::Pending).len(), 1);
        assert!(!m.is_untouched());
    }

    #[test]
    fn test_unknown_id() {
        let mut m = manager();
        let err = m.mark_in_progress("ghost").unwrap_err();
        assert_eq!(err.code, "TODO_NOT_FOUND");
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut m = manager();
        m.create("a", "ok", Some("a")).unwrap();
        m.create("b", "ok", None).unwrap();
        m.mark_complete("a", "done it").unwrap();
        m.attach_tool_call(
            "a",
            ToolCallRecord {
                tool_name: "read_file".into(),
                params: serde_json::json!({"path": "a.txt"}),
                success: true,
                summary: "File a.txt read successfully".into(),
                at: Utc::now(),
            },
        )
        .unwrap();
        let snapshot = m.export();

        let mut fresh = manager();
        fresh.import(snapshot.clone()).unwrap();
        assert_eq!(fresh.export(), snapshot);
        assert_eq!(fresh.get("a").unwrap().latest_tool_summary(), Some("File a.txt read successfully"));
    }

    #[test]
    fn test_import_rejects_duplicates_without_mutation() {
        let mut m = manager();
        m.create("keep", "ok", Some("keep")).unwrap();
        let mut other = manager();
        other.create("x", "ok", Some("x")).unwrap();
        let mut snapshot = other.export();
        snapshot.push(snapshot[0].clone());
        assert!(m.import(snapshot).is_err());
        assert_eq!(m.list()[0].id, "keep");
    }
}
