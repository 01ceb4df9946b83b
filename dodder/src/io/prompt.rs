//! System and corrective prompt rendering.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::io::shell::ShellInfo;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const CORRECTION_TEMPLATE: &str = include_str!("prompts/correction.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system template")?;
        env.add_template("correction", CORRECTION_TEMPLATE)
            .context("load correction template")?;
        Ok(Self { env })
    }

    /// Render the system turn for a run rooted at `root`.
    pub fn render_system(
        &self,
        shell: &ShellInfo,
        root: &Path,
        instructions: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template("system")?;
        let rendered = template
            .render(context! {
                os => host_os(),
                shell => shell.to_string(),
                root => root.display().to_string(),
                instructions => instructions.map(str::trim).filter(|s| !s.is_empty()),
            })
            .context("render system prompt")?;
        Ok(rendered)
    }

    /// Render the corrective re-prompt for a rejected reply.
    pub fn render_correction(&self, error: &str) -> Result<String> {
        let template = self.env.get_template("correction")?;
        let rendered = template
            .render(context! { error => error.trim() })
            .context("render correction prompt")?;
        Ok(rendered)
    }
}

fn host_os() -> String {
    format!("{} ({})", std::env::consts::OS, std::env::consts::FAMILY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::shell::ShellFlavor;
    use std::path::PathBuf;

    fn bash() -> ShellInfo {
        ShellInfo {
            name: "bash".to_string(),
            program: PathBuf::from("/bin/bash"),
            flavor: ShellFlavor::Posix,
        }
    }

    #[test]
    fn system_prompt_names_environment_and_shape() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_system(&bash(), Path::new("/work/app"), None)
            .expect("render");
        assert!(prompt.contains("Shell: bash (/bin/bash)"));
        assert!(prompt.contains("Project root: /work/app"));
        assert!(prompt.contains("\"nextMessage\""));
        assert!(prompt.contains("run-command"));
        assert!(!prompt.contains("Project instructions"));
    }

    #[test]
    fn system_prompt_appends_instructions() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_system(&bash(), Path::new("/work/app"), Some("  Use pnpm.\n"))
            .expect("render");
        assert!(prompt.trim_end().ends_with("Use pnpm."));
        assert!(prompt.contains("## Project instructions"));
    }

    #[test]
    fn blank_instructions_are_omitted() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_system(&bash(), Path::new("/work/app"), Some("   "))
            .expect("render");
        assert!(!prompt.contains("Project instructions"));
    }

    #[test]
    fn correction_quotes_the_error() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_correction("malformed output: expected value at line 1 column 1")
            .expect("render");
        assert!(prompt.contains("expected value at line 1 column 1"));
        assert!(prompt.contains("exactly one JSON object"));
    }
}
