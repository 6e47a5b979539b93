//! Command list files.
//!
//! A command list is a plain text file with one debugger command per line.
//! Empty lines and `#` comments are skipped; everything else is handed to the
//! engine verbatim.

use std::path::{Path, PathBuf};

use crate::Result;

/// Default command list file name, looked up in the working directory.
pub const DEFAULT_COMMAND_FILE: &str = "commandlist.txt";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandScript {
    commands: Vec<String>,
}

impl CommandScript {
    /// Parse commands from the contents of a command list.
    pub fn parse(text: &str) -> Self {
        let commands = text
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .filter(|line| !line.trim_start().starts_with('#'))
            .map(str::to_owned)
            .collect();

        Self { commands }
    }

    /// Load a command list. A missing file yields an empty script.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no command list");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Resolve the command list path: an explicit path wins, otherwise
/// [`DEFAULT_COMMAND_FILE`] in the current directory.
pub fn command_file_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(std::env::current_dir()?.join(DEFAULT_COMMAND_FILE)),
    }
}
