use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;

/// Append-only CSV file with a fixed header line
///
/// The file is opened for every append, so a log that was moved away or
/// could not be written once is simply recreated (with its header) on the
/// next call.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    header: String,
}

impl LogFile {
    pub fn new(path: impl Into<PathBuf>, header: impl Into<String>) -> Self {
        LogFile {
            path: path.into(),
            header: header.into(),
        }
    }

    /// Append one line, writing the header first when the file is empty
    ///
    /// Callers must serialize appends to the same file.
    pub async fn append_line(&self, line: &str) -> Result<(), StorageError> {
        self.try_append(line).await.map_err(|source| StorageError {
            path: self.path.clone(),
            source,
        })
    }

    async fn try_append(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut buffer = String::with_capacity(self.header.len() + line.len() + 2);
        if file.metadata().await?.len() == 0 {
            buffer.push_str(&self.header);
            buffer.push('\n');
        }
        buffer.push_str(line);
        buffer.push('\n');

        file.write_all(buffer.as_bytes()).await?;
        file.flush().await
    }
}

/// File name for a device label, keeping it inside the data directory
pub fn file_name_for(label: &str) -> String {
    let stem: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.csv", stem)
}
