use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::templates::Template;

// ── Fragment (ephemeral, never persisted) ─────────────────────────────

/// A single generated file in a multi-file fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentFile {
    pub file_path: String,
    pub file_content: String,
}

/// Generated code: either one file or many. The model may emit either shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FragmentCode {
    Files(Vec<FragmentFile>),
    Single { file_path: String, code: String },
}

impl FragmentCode {
    /// Normalize to `(path, content)` pairs, one per file to write.
    pub fn files(&self) -> Vec<(String, String)> {
        match self {
            Self::Files(files) => files
                .iter()
                .map(|f| (f.file_path.clone(), f.file_content.clone()))
                .collect(),
            Self::Single { file_path, code } => vec![(file_path.clone(), code.clone())],
        }
    }
}

/// The structured object produced by the completion step and consumed
/// immediately by the sandbox step. Created per chat turn, discarded after
/// execution; only the resulting URL/logs survive downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub template: Template,
    #[serde(default)]
    pub commentary: String,
    pub code: FragmentCode,
    #[serde(default)]
    pub has_additional_dependencies: bool,
    #[serde(default)]
    pub install_dependencies_command: String,
    #[serde(default)]
    pub additional_dependencies: Vec<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

// ── Execution result ──────────────────────────────────────────────────

/// Outcome of running a fragment in a sandbox. The two variants are
/// mutually exclusive: an interpreter run never carries a URL, a web-app
/// run never carries stdout/stderr/cell results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionResult {
    #[serde(rename_all = "camelCase")]
    Interpreter {
        sbx_id: String,
        template: Template,
        stdout: String,
        stderr: String,
        runtime_error: Option<String>,
        cell_results: Vec<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    WebApp {
        sbx_id: String,
        template: Template,
        url: String,
        port: u16,
    },
}

// ── Minigraph (published gallery entry) ───────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Minigraph {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub purpose: String,
    pub url: String,
    pub screenshot_url: String,
    pub facebook: bool,
    pub instagram: bool,
    pub twitter: bool,
    pub created_at: String,
}

// ── Tasks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub team_id: Option<String>,
    pub owner_id: String,
    pub assigned_user_id: Option<String>,
    pub due_date: Option<String>,
    pub due_time: Option<String>,
    pub status: TaskStatus,
    pub not_urgent: bool,
    pub created_at: String,
}

/// Binds a task to its externally hosted messaging channel. Created once
/// per task at assignment time, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub task_id: i64,
    pub channel_id: String,
    pub participants: Vec<String>,
}

/// A task attachment persisted after a successful file write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUpload {
    pub id: i64,
    pub task_id: i64,
    pub file_name: String,
    pub stored_path: String,
    pub created_at: String,
}

// ── Notifications ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: String,
    pub message: String,
    pub read: bool,
    pub created_at: String,
}

// ── Settings ──────────────────────────────────────────────────────────

/// One row per user. The billing customer id is lazily created on first
/// billing-related read and written back at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSettings {
    pub user_id: String,
    pub display_name: Option<String>,
    pub theme: String,
    pub email_notifications: bool,
    pub push_notifications: bool,
    pub stripe_customer_id: Option<String>,
    pub subscription_status: Option<String>,
}

/// Tenant branding overrides consumed by the prompt builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branding {
    pub user_id: String,
    pub header: Option<String>,
    pub footer: Option<String>,
    pub font: Option<String>,
    pub palette: Option<String>,
}

// ── API view types ────────────────────────────────────────────────────

/// Response for task creation: the persisted row, the chat binding if the
/// assignment invariant held, and the names of any attachments whose file
/// writes failed (the task itself is persisted regardless).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreated {
    pub task: Task,
    pub chat: Option<Chat>,
    pub failed_attachments: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_roundtrip() {
        for s in &["pending", "accepted", "in_progress", "completed", "cancelled"] {
            let parsed: TaskStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("archived".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_fragment_code_single_shape() {
        let json = r#"{"file_path": "app.py", "code": "print(1)"}"#;
        let code: FragmentCode = serde_json::from_str(json).unwrap();
        let files = code.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0], ("app.py".to_string(), "print(1)".to_string()));
    }

    #[test]
    fn test_fragment_code_array_shape() {
        let json = r#"[
            {"file_path": "pages/index.tsx", "file_content": "export default ..."},
            {"file_path": "minigram.config.json", "file_content": "{}"}
        ]"#;
        let code: FragmentCode = serde_json::from_str(json).unwrap();
        assert_eq!(code.files().len(), 2);
    }

    #[test]
    fn test_fragment_code_empty_array() {
        let code: FragmentCode = serde_json::from_str("[]").unwrap();
        assert!(code.files().is_empty());
    }

    #[test]
    fn test_fragment_defaults() {
        let json = r#"{
            "template": "nextjs-developer",
            "code": {"file_path": "pages/index.tsx", "code": "..."}
        }"#;
        let fragment: Fragment = serde_json::from_str(json).unwrap();
        assert!(!fragment.has_additional_dependencies);
        assert!(fragment.additional_dependencies.is_empty());
        assert!(fragment.port.is_none());
    }

    #[test]
    fn test_execution_result_shapes_are_exclusive() {
        let web = ExecutionResult::WebApp {
            sbx_id: "sbx1".into(),
            template: Template::NextjsDeveloper,
            url: "https://3000-sbx1.minigram.dev".into(),
            port: 3000,
        };
        let value = serde_json::to_value(&web).unwrap();
        assert!(value.get("url").is_some());
        assert!(value.get("stdout").is_none());
        assert!(value.get("cellResults").is_none());

        let interp = ExecutionResult::Interpreter {
            sbx_id: "sbx2".into(),
            template: Template::CodeInterpreter,
            stdout: "42\n".into(),
            stderr: String::new(),
            runtime_error: None,
            cell_results: vec![],
        };
        let value = serde_json::to_value(&interp).unwrap();
        assert!(value.get("url").is_none());
        assert!(value.get("stdout").is_some());
        assert_eq!(value["sbxId"], "sbx2");
    }
}
