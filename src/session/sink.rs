//! Журнал звонков: итоговые записи, сообщения чата и файлы.

use crate::error::{CallError, Result};
use crate::session::model::{CallLogRecord, ChatMessage, SharedFileRef};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

/// Хранилище только на добавление, ключ записи это id звонка
#[async_trait]
pub trait CallLogSink: Send + Sync {
    async fn persist(&self, call_id: &str, record: &CallLogRecord) -> Result<()>;

    async fn persist_message(&self, call_id: &str, message: &ChatMessage) -> Result<()>;

    async fn persist_file(&self, call_id: &str, file: &SharedFileRef) -> Result<()>;
}

const CALL_LOGS_FILE: &str = "call_logs.jsonl";

/// Строка файла сообщений и файлов: id звонка и сама запись
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Line<'a, T: Serialize> {
    call_id: &'a str,
    #[serde(flatten)]
    entry: &'a T,
}

/// JSON lines в каталоге:
///
/// - `call_logs.jsonl` итоги звонков
/// - `<call_id>/messages.jsonl` сообщения чата
/// - `<call_id>/files.jsonl` файлы
pub struct JsonlLogSink {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn call_dir(&self, call_id: &str) -> PathBuf {
        self.dir.join(sanitize(call_id))
    }

    async fn append<T: Serialize + Sync>(&self, path: PathBuf, entry: &T) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(persistence)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                error!(
                    event = "call_log_open_failure",
                    path = %path.display(),
                    error = %e,
                    "Failed to open call log"
                );
                persistence(e)
            })?;
        file.write_all(&line).await.map_err(persistence)?;
        file.flush().await.map_err(persistence)?;
        debug!(path = %path.display(), "Call log entry appended");
        Ok(())
    }
}

#[async_trait]
impl CallLogSink for JsonlLogSink {
    async fn persist(&self, call_id: &str, record: &CallLogRecord) -> Result<()> {
        debug!(call_id, "Persisting call log record");
        self.append(self.dir.join(CALL_LOGS_FILE), record).await
    }

    async fn persist_message(&self, call_id: &str, message: &ChatMessage) -> Result<()> {
        let line = Line {
            call_id,
            entry: message,
        };
        self.append(self.call_dir(call_id).join("messages.jsonl"), &line)
            .await
    }

    async fn persist_file(&self, call_id: &str, file: &SharedFileRef) -> Result<()> {
        let line = Line {
            call_id,
            entry: file,
        };
        self.append(self.call_dir(call_id).join("files.jsonl"), &line)
            .await
    }
}

fn persistence(e: std::io::Error) -> CallError {
    CallError::Persistence(e.to_string())
}

/// id звонка приходит с сервера, в имени каталога оставляем только безопасные символы
fn sanitize(call_id: &str) -> String {
    call_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
