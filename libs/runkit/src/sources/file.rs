use arc_swap::ArcSwap;
use async_trait::async_trait;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ChangeEvent, Format, Source, SourceError, WatchCallback};
use crate::tasks::{TaskLauncher, TaskOptions};

/// Quiet period collapsing the burst of events editors emit per save.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

type Sections = Map<String, Value>;

/// Local YAML or JSON document; every top-level key is a section.
pub struct FileSource {
    path: PathBuf,
    format: Format,
    document: Arc<ArcSwap<Sections>>,
}

impl FileSource {
    pub const NAME: &'static str = "file";

    /// Read and parse the document at `path`. The format follows the extension.
    ///
    /// # Errors
    /// Returns [`SourceError::Backend`] if the file cannot be read and
    /// [`SourceError::Codec`] if it is not a mapping.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let path = path.into();
        let format = Format::from_extension(path.extension().and_then(|e| e.to_str()));
        let sections = read_sections(&path, format)?;
        tracing::debug!(path = %path.display(), sections = sections.len(), "Config file parsed");
        Ok(Self {
            path,
            format,
            document: Arc::new(ArcSwap::from_pointee(sections)),
        })
    }

    /// Build a source over an in-memory document, attributed to `path`.
    ///
    /// # Errors
    /// Returns [`SourceError::Codec`] if `document` is not a mapping.
    pub fn from_document(path: impl Into<PathBuf>, document: Value) -> Result<Self, SourceError> {
        let path = path.into();
        let format = Format::from_extension(path.extension().and_then(|e| e.to_str()));
        let sections = into_sections(&path, document)?;
        Ok(Self {
            path,
            format,
            document: Arc::new(ArcSwap::from_pointee(sections)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file. On error the previous document is kept.
    ///
    /// # Errors
    /// See [`FileSource::open`].
    pub fn reload(&self) -> Result<(), SourceError> {
        let sections = read_sections(&self.path, self.format)?;
        self.document.store(Arc::new(sections));
        Ok(())
    }

    fn section(&self, key: &str) -> Option<Value> {
        self.document.load().get(key).cloned()
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("sections", &self.document.load().len())
            .finish()
    }
}

/// Wait out the debounce window, then drop the signals queued meanwhile.
/// Returns `false` if `cancel` fires first.
async fn settle(cancel: &CancellationToken, rx: &mut mpsc::UnboundedReceiver<()>) -> bool {
    tokio::select! {
        () = cancel.cancelled() => return false,
        () = tokio::time::sleep(RELOAD_DEBOUNCE) => {}
    }
    while rx.try_recv().is_ok() {}
    true
}

fn into_sections(path: &Path, document: Value) -> Result<Sections, SourceError> {
    match document {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Sections::new()),
        other => Err(SourceError::Codec {
            key: path.display().to_string(),
            message: format!("expected a mapping at the top level, found {other}"),
        }),
    }
}

fn read_sections(path: &Path, format: Format) -> Result<Sections, SourceError> {
    let key = path.display().to_string();
    let raw = std::fs::read(path).map_err(|e| SourceError::Backend {
        key: key.clone(),
        source: anyhow::Error::new(e).context("failed to read config file"),
    })?;
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Sections::new());
    }
    into_sections(path, format.decode(&key, &raw)?)
}

#[async_trait]
impl Source for FileSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn scan(&self, key: &str, target: &mut Value) -> Result<(), SourceError> {
        *target = self.section(key).ok_or_else(|| SourceError::NotFound {
            key: key.to_owned(),
        })?;
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, SourceError> {
        Ok(self.document.load().contains_key(key))
    }

    async fn watch(
        &self,
        tasks: &TaskLauncher,
        cancel: CancellationToken,
        key: &str,
        callback: WatchCallback,
    ) -> Result<(), SourceError> {
        let backend_err = |e: notify::Error| SourceError::Backend {
            key: key.to_owned(),
            source: anyhow::Error::new(e).context("failed to watch config file"),
        };

        let file_name: Option<OsString> = self.path.file_name().map(ToOwned::to_owned);
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        // Editors often replace the file, so watch its directory.
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let touches_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(ToOwned::to_owned) == file_name);
                    if touches_file && (event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()) {
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Config file watch error"),
            },
            notify::Config::default(),
        )
        .map_err(backend_err)?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(backend_err)?;

        let path = self.path.clone();
        let format = self.format;
        let document = Arc::clone(&self.document);
        let key = key.to_owned();
        let mut last = self.section(&key);

        tracing::info!(path = %path.display(), key = %key, "Watching config file");
        tasks.go(
            cancel,
            TaskOptions::named(format!("watch:file:{key}")),
            move |cancel| async move {
                let _watcher = watcher;
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        signal = rx.recv() => {
                            if signal.is_none() {
                                break;
                            }
                        }
                    }

                    if !settle(&cancel, &mut rx).await {
                        break;
                    }

                    let sections = match read_sections(&path, format) {
                        Ok(sections) => sections,
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "Config file reload failed; keeping previous document");
                            continue;
                        }
                    };
                    let current = sections.get(&key).cloned();
                    document.store(Arc::new(sections));

                    let event = match (&last, &current) {
                        (Some(old), Some(new)) if old == new => None,
                        (_, Some(_)) => Some(ChangeEvent::Update),
                        (Some(_), None) => Some(ChangeEvent::Delete),
                        (None, None) => None,
                    };
                    last = current;
                    if let Some(event) = event {
                        tracing::debug!(key = %key, ?event, "Config file section changed");
                        callback(event);
                    }
                }
                Ok(())
            },
        );
        Ok(())
    }
}
