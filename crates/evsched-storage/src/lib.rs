//! Page fetching and tabular store capabilities.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evsched-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no page available for {url}")]
    NotFound { url: String },
}

/// Retrieves the raw text of a schedule page.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-attempt HTTP fetcher. Failures surface to the caller untouched.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.text().await?;
            debug!(bytes = body.len(), "fetched page");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

/// Serves pages from memory, keyed by URL. Used for offline runs and fixtures.
#[derive(Debug, Clone, Default)]
pub struct StaticPageFetcher {
    pages: HashMap<String, String>,
}

impl StaticPageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.pages.insert(url.into(), body.into());
        self
    }
}

#[async_trait]
impl PageFetcher for StaticPageFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                url: url.to_string(),
            })
    }
}

/// Tabular store capability. Row 0 is the header row; indices are zero-based.
pub trait Sheet {
    fn name(&self) -> &str;
    fn row_count(&self) -> usize;
    fn column_count(&self) -> usize;
    fn find_column_by_header(&self, header: &str) -> Option<usize>;
    /// First data row (header excluded) whose cell in `column` equals `value`.
    /// A blank `value` never matches.
    fn find_row_by_cell_value(&self, column: usize, value: &str) -> Option<usize>;
    /// Empty string for cells outside the populated range.
    fn get_cell(&self, row: usize, column: usize) -> &str;
    /// Writing past the populated range grows the grid.
    fn set_cell(&mut self, row: usize, column: usize, value: &str);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSheet {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

impl GridSheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
        }
    }

    pub fn from_rows<R, C>(name: impl Into<String>, rows: R) -> Self
    where
        R: IntoIterator<Item = C>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            name: name.into(),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(Into::into).collect())
                .collect(),
        }
    }
}

impl Sheet for GridSheet {
    fn name(&self) -> &str {
        &self.name
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn column_count(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    fn find_column_by_header(&self, header: &str) -> Option<usize> {
        self.rows
            .first()?
            .iter()
            .position(|cell| cell.trim() == header)
    }

    fn find_row_by_cell_value(&self, column: usize, value: &str) -> Option<usize> {
        let needle = value.trim();
        if needle.is_empty() {
            return None;
        }
        self.rows
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, row)| row.get(column).is_some_and(|cell| cell.trim() == needle))
            .map(|(idx, _)| idx)
    }

    fn get_cell(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    fn set_cell(&mut self, row: usize, column: usize, value: &str) {
        if self.rows.len() <= row {
            self.rows.resize_with(row + 1, Vec::new);
        }
        let cells = &mut self.rows[row];
        if cells.len() <= column {
            cells.resize_with(column + 1, String::new);
        }
        cells[column] = value.to_string();
    }
}

/// Named sheets persisted together as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workbook {
    #[serde(default)]
    pub sheets: Vec<GridSheet>,
}

impl Workbook {
    pub fn new(sheets: Vec<GridSheet>) -> Self {
        Self { sheets }
    }

    pub fn sheet(&self, name: &str) -> Option<&GridSheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet_mut(&mut self, name: &str) -> Option<&mut GridSheet> {
        self.sheets.iter_mut().find(|s| s.name == name)
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading workbook {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing workbook {}", path.display()))
    }

    /// Writes the workbook through a temp file and atomic rename.
    pub async fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(self).context("serializing workbook")?;

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating workbook directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.workbook.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp workbook file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp workbook file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp workbook file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp workbook {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}
