use crate::error::{CallError, Result};
use async_trait::async_trait;
use reqwest::Url;
use tracing::debug;

/// Файл, доступный собеседнику по ссылке
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedFile {
    pub url: String,
    pub size: u64,
}

/// Сопоставляет локальному файлу URL. Загрузка файла сюда не входит.
#[async_trait]
pub trait FileLocator: Send + Sync {
    async fn locate(&self, path: &str, name: &str) -> Result<LocatedFile>;
}

/// Ссылка WebDAV Nextcloud: `{base}/remote.php/dav/files/{user}/{name}`
pub struct DavFileLocator {
    base_url: Url,
    user_id: String,
}

impl DavFileLocator {
    pub fn new(base_url: &str, user_id: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| CallError::Config(format!("invalid server url {}: {}", base_url, e)))?;
        Ok(Self {
            base_url,
            user_id: user_id.into(),
        })
    }

    fn dav_url(&self, name: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CallError::Config("server url cannot be a base".into()))?
            .pop_if_empty()
            .extend(["remote.php", "dav", "files", self.user_id.as_str()])
            .extend(name.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }
}

#[async_trait]
impl FileLocator for DavFileLocator {
    async fn locate(&self, path: &str, name: &str) -> Result<LocatedFile> {
        // уже загруженный файл передаём как есть
        let url = if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            self.dav_url(name)?.to_string()
        };

        // отсутствующий файл имеет размер 0
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        debug!(%url, size, "File located");
        Ok(LocatedFile { url, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_dav_url_and_reads_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheme.pdf");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let locator = DavFileLocator::new("https://cloud.example.org/", "glasses 7").unwrap();
        let file = locator
            .locate(path.to_str().unwrap(), "scheme.pdf")
            .await
            .unwrap();
        assert_eq!(
            file.url,
            "https://cloud.example.org/remote.php/dav/files/glasses%207/scheme.pdf"
        );
        assert_eq!(file.size, 2048);
    }

    #[tokio::test]
    async fn remote_urls_pass_through() {
        let locator = DavFileLocator::new("https://cloud.example.org", "u").unwrap();
        let file = locator
            .locate("https://cdn.example.org/manual.pdf", "manual.pdf")
            .await
            .unwrap();
        assert_eq!(file.url, "https://cdn.example.org/manual.pdf");
        assert_eq!(file.size, 0);
    }
}
