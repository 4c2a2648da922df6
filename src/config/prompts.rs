//! Prompt templates for tubechat.
//!
//! Prompts can be customized by placing TOML files in the custom prompts directory.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Marker the answer model emits when the excerpts do not address the question.
pub const NOT_COVERED_MARKER: &str = "NOT_COVERED";

/// Collection of all prompt templates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Prompts {
    pub rag: RagPrompts,
    /// Custom variables from config, available in all prompts.
    #[serde(skip)]
    pub variables: HashMap<String, String>,
}

/// Prompts for answer generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagPrompts {
    pub system: String,
    pub user: String,
}

impl Default for RagPrompts {
    fn default() -> Self {
        Self {
            system: r#"You are {{creator_name}}'s assistant. You answer questions from their audience using only excerpts from {{creator_name}}'s video transcripts.

Guidelines:
- Answer only from the provided excerpts, speaking about the creator in the third person
- Refer to excerpts by their bracketed number, e.g. [2], when a claim comes from one
- Never invent video titles, timestamps or quotes
- Use earlier conversation turns only to resolve what "it", "that" or "they" refer to
- If the excerpts do not address the question, reply with exactly NOT_COVERED and nothing else
- Be concise"#
                .to_string(),

            user: r#"Question: {{question}}

Confidence in the retrieved excerpts: {{confidence}}

Excerpts from {{creator_name}}'s videos:

{{context}}

Answer the question using the excerpts above."#
                .to_string(),
        }
    }
}

impl Prompts {
    /// Load prompts from the default location, with optional custom directory and variables.
    pub fn load(
        custom_dir: Option<&str>,
        custom_variables: Option<&HashMap<String, String>>,
    ) -> crate::error::Result<Self> {
        let mut prompts = Prompts::default();

        if let Some(vars) = custom_variables {
            prompts.variables = vars.clone();
        }

        if let Some(dir) = custom_dir {
            let custom_path = PathBuf::from(shellexpand::tilde(dir).to_string());

            let rag_path = custom_path.join("rag.toml");
            if rag_path.exists() {
                let content = std::fs::read_to_string(&rag_path)?;
                prompts.rag = toml::from_str(&content)?;
            }
        }

        Ok(prompts)
    }

    /// Render a prompt template with the given variables.
    pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
        let mut result = template.to_string();
        for (key, value) in vars {
            result = result.replace(&format!("{{{{{}}}}}", key), value);
        }
        result
    }

    /// Render a prompt template with both provided variables and custom config variables.
    /// Provided variables take precedence over custom config variables.
    pub fn render_with_custom(&self, template: &str, vars: &HashMap<String, String>) -> String {
        let mut merged = self.variables.clone();
        for (key, value) in vars {
            merged.insert(key.clone(), value.clone());
        }
        Self::render(template, &merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prompts_mention_marker() {
        let prompts = Prompts::default();
        assert!(prompts.rag.system.contains(NOT_COVERED_MARKER));
        assert!(prompts.rag.user.contains("{{question}}"));
    }

    #[test]
    fn test_render_prefers_call_variables() {
        let mut prompts = Prompts::default();
        prompts
            .variables
            .insert("creator_name".to_string(), "Config Name".to_string());

        let mut vars = HashMap::new();
        vars.insert("creator_name".to_string(), "Ferris".to_string());

        let rendered = prompts.render_with_custom("Hi {{creator_name}}", &vars);
        assert_eq!(rendered, "Hi Ferris");
    }

    #[test]
    fn test_load_custom_rag_prompts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("rag.toml"),
            "system = \"custom system\"\nuser = \"{{question}}\"\n",
        )
        .unwrap();

        let prompts = Prompts::load(dir.path().to_str(), None).unwrap();
        assert_eq!(prompts.rag.system, "custom system");
    }
}
