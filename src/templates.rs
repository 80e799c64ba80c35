//! Fragment template registry.
//!
//! Templates are an explicit enumerated mapping rather than a string-indexed
//! registry: unknown identifiers are rejected with a clear error instead of
//! silently falling back.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The sandbox image a generated fragment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Template {
    NextjsDeveloper,
    VueDeveloper,
    StreamlitDeveloper,
    GradioDeveloper,
    #[serde(rename = "code-interpreter-v1")]
    CodeInterpreter,
}

/// All known templates, in the order they are offered to the model.
pub const ALL_TEMPLATES: &[Template] = &[
    Template::NextjsDeveloper,
    Template::VueDeveloper,
    Template::StreamlitDeveloper,
    Template::GradioDeveloper,
    Template::CodeInterpreter,
];

impl Template {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NextjsDeveloper => "nextjs-developer",
            Self::VueDeveloper => "vue-developer",
            Self::StreamlitDeveloper => "streamlit-developer",
            Self::GradioDeveloper => "gradio-developer",
            Self::CodeInterpreter => "code-interpreter-v1",
        }
    }

    /// Scaffold description enumerated in the system prompt.
    pub fn scaffold(&self) -> &'static str {
        match self {
            Self::NextjsDeveloper => {
                "Next.js 14 app router project. Entry file: pages/index.tsx. \
                 Dev server runs on port 3000. Tailwind is preconfigured."
            }
            Self::VueDeveloper => {
                "Vue 3 + Nuxt 3 project. Entry file: app.vue. \
                 Dev server runs on port 3000. Do not touch nuxt.config.ts."
            }
            Self::StreamlitDeveloper => {
                "Streamlit app. Entry file: app.py. Server runs on port 8501 \
                 and reloads automatically."
            }
            Self::GradioDeveloper => {
                "Gradio app. Entry file: app.py. The Gradio Blocks/Interface \
                 must be named `demo`. Server runs on port 7860."
            }
            Self::CodeInterpreter => {
                "Python data-analysis runtime. Code is executed as a notebook \
                 cell; stdout, stderr, and rich cell results are captured."
            }
        }
    }

    /// Default port the template's server listens on, if it has one.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::NextjsDeveloper | Self::VueDeveloper => Some(3000),
            Self::StreamlitDeveloper => Some(8501),
            Self::GradioDeveloper => Some(7860),
            Self::CodeInterpreter => None,
        }
    }

    /// Interpreter templates execute code in-process and never expose a URL;
    /// web templates do the opposite.
    pub fn is_interpreter(&self) -> bool {
        matches!(self, Self::CodeInterpreter)
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Template {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nextjs-developer" => Ok(Self::NextjsDeveloper),
            "vue-developer" => Ok(Self::VueDeveloper),
            "streamlit-developer" => Ok(Self::StreamlitDeveloper),
            "gradio-developer" => Ok(Self::GradioDeveloper),
            "code-interpreter-v1" => Ok(Self::CodeInterpreter),
            _ => Err(format!("Unknown template: {}", s)),
        }
    }
}
