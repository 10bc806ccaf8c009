//! Chat transcript logging.
//!
//! When `--chatlog` is given, every committed conversation message is
//! appended to the file as one JSON line with a timestamp. Log failures are
//! reported once per write attempt and never interrupt the session.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde_json::Value;

use crate::api::ChatMessage;

pub struct ChatLogger {
    path: PathBuf,
}

impl ChatLogger {
    /// Opens the log for appending, probing write access up front so a bad
    /// path fails at startup instead of mid-conversation.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, message: &ChatMessage) -> std::io::Result<()> {
        let mut record = serde_json::to_value(message)?;
        if let Value::Object(map) = &mut record {
            map.insert(
                "time".to_string(),
                Value::String(Local::now().to_rfc3339()),
            );
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{record}")?;
        file.flush()
    }

    pub fn append_all<'a>(
        &mut self,
        messages: impl IntoIterator<Item = &'a ChatMessage>,
    ) -> std::io::Result<()> {
        for message in messages {
            self.append(message)?;
        }
        Ok(())
    }
}
