//! Line-oriented user input.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

/// Source of free-text user input.
pub trait UserInput {
    /// Show `prompt` and read one line. `None` means end of input.
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>>;
}

/// Reads from any buffered reader, echoing prompts to a writer.
pub struct LineInput<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> LineInput<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

/// Interactive input on the process's stdin/stdout.
pub fn stdin_input() -> LineInput<std::io::StdinLock<'static>, std::io::Stdout> {
    LineInput::new(std::io::stdin().lock(), std::io::stdout())
}

impl<R: BufRead, W: Write> UserInput for LineInput<R, W> {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        self.writer
            .write_all(prompt.as_bytes())
            .context("write prompt")?;
        self.writer.flush().context("flush prompt")?;

        let mut line = String::new();
        let read = self.reader.read_line(&mut line).context("read input")?;
        if read == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_lines_and_echoes_prompt() {
        let mut output = Vec::new();
        {
            let mut input = LineInput::new("first\r\nsecond\n".as_bytes(), &mut output);
            assert_eq!(input.read_line("> ").expect("read").as_deref(), Some("first"));
            assert_eq!(input.read_line("> ").expect("read").as_deref(), Some("second"));
            assert_eq!(input.read_line("> ").expect("read"), None);
        }
        assert_eq!(output, b"> > > ");
    }
}
