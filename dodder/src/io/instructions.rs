//! Loading of extra project instructions for the system prompt.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

const ALLOWED_EXTENSIONS: [&str; 2] = ["txt", "md"];

/// Combine the instruction file (first) and inline `--instr` text.
///
/// Returns `None` when neither source contributes any non-blank text.
pub fn load_instructions(file: Option<&Path>, inline: Option<&str>) -> Result<Option<String>> {
    let mut parts = Vec::new();

    if let Some(path) = file {
        let text = read_instructions_file(path)?;
        if !text.trim().is_empty() {
            parts.push(text.trim().to_string());
        }
    }
    if let Some(text) = inline.map(str::trim).filter(|s| !s.is_empty()) {
        parts.push(text.to_string());
    }

    Ok((!parts.is_empty()).then(|| parts.join("\n\n")))
}

/// Read an instructions file. Only `.txt` and `.md` files are accepted.
pub fn read_instructions_file(path: &Path) -> Result<String> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    if !extension
        .as_deref()
        .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext))
    {
        return Err(anyhow!(
            "instructions file must be a .txt or .md file (got {})",
            path.display()
        ));
    }
    fs::read_to_string(path).with_context(|| format!("read instructions file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_text_comes_before_inline_text() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("rules.md");
        fs::write(&path, "Use TypeScript.\n").expect("write");
        let text = load_instructions(Some(&path), Some("Prefer pnpm."))
            .expect("load")
            .expect("some");
        assert_eq!(text, "Use TypeScript.\n\nPrefer pnpm.");
    }

    #[test]
    fn nothing_given_is_none() {
        assert_eq!(load_instructions(None, None).expect("load"), None);
        assert_eq!(load_instructions(None, Some("  ")).expect("load"), None);
    }

    #[test]
    fn rejects_other_extensions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("rules.json");
        fs::write(&path, "{}").expect("write");
        let err = load_instructions(Some(&path), None).unwrap_err();
        assert!(err.to_string().contains(".txt or .md"));
    }

    #[test]
    fn uppercase_extension_is_accepted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("RULES.TXT");
        fs::write(&path, "be brief").expect("write");
        assert_eq!(read_instructions_file(&path).expect("read"), "be brief");
    }

    #[test]
    fn missing_file_names_the_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("absent.txt");
        let err = load_instructions(Some(&path), None).unwrap_err();
        assert!(err.to_string().contains("absent.txt"));
    }
}
