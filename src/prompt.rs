//! System-prompt assembly for the fragment generator.
//!
//! The prompt enumerates the available templates plus fixed scaffolding
//! instructions, and tenant branding overrides are injected as synthetic
//! "user" turns appended to the message list before it is sent downstream.

use serde::{Deserialize, Serialize};

use crate::server::models::Branding;
use crate::templates::Template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of conversation history sent to the model provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Fixed scaffolding rules every generated fragment must follow, regardless
/// of template.
const SCAFFOLDING_RULES: &str = r#"Rules:
- You MUST respond with a single JSON object matching the fragment schema (no markdown, no explanation):
  {
    "template": "<template id>",
    "commentary": "What you are building and why",
    "code": [{"file_path": "relative/path", "file_content": "..."}] or {"file_path": "relative/path", "code": "..."},
    "has_additional_dependencies": false,
    "install_dependencies_command": "",
    "additional_dependencies": [],
    "port": 3000 or null
  }
- Every web-app fragment MUST include the file `minigram.config.json` with exactly this content: {"runtime": "minigram", "version": 1}
- Every web-app fragment MUST import the shared header component: `import { MinigramHeader } from "@/components/minigram-header"` and render it at the top of the page.
- Use the interpreter template only for pure computation with no UI.
- Set has_additional_dependencies and install_dependencies_command only when the template scaffold does not already provide a library you need.
"#;

/// Build the system prompt for a fragment-generation turn.
pub fn build_system_prompt(templates: &[Template]) -> String {
    let mut prompt = String::from(
        "You generate a single runnable code fragment per turn. \
         Pick exactly one of the available templates:\n\n",
    );
    for template in templates {
        prompt.push_str(&format!("- {}: {}\n", template.as_str(), template.scaffold()));
    }
    prompt.push('\n');
    prompt.push_str(SCAFFOLDING_RULES);
    prompt
}

/// Append one synthetic user turn per present branding field, in a fixed
/// order (header, footer, font, palette). Absent fields append nothing.
/// This mutates the message list in place before it is sent downstream.
pub fn apply_branding(messages: &mut Vec<ChatMessage>, branding: &Branding) {
    let overrides: [(&str, &Option<String>); 4] = [
        ("header", &branding.header),
        ("footer", &branding.footer),
        ("font", &branding.font),
        ("palette", &branding.palette),
    ];
    for (field, value) in overrides {
        if let Some(value) = value {
            messages.push(ChatMessage::user(format!(
                "Apply this {} verbatim to the generated app: {}",
                field, value
            )));
        }
    }
}
