//! Sincronización de una carpeta local con la lista de documentos persistentes.
//!
//! Recorre la carpeta, lee los ficheros de texto soportados y los fusiona por
//! nombre (ruta relativa) con el repositorio. Una ejecución periódica que
//! coincida con otra en curso se omite.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::{
    app_state::{lock, Status},
    locale::Locale,
    models::Document,
    store::{DocumentRepository, MergeSummary},
};

/// Extensiones que se consideran texto.
pub const SYNC_EXTENSIONS: &[&str] = &[
    "txt", "md", "log", "py", "js", "json", "c", "cpp", "h", "java", "html", "css", "csv", "rb",
    "go", "rs", "php",
];

/// Resultado de una pasada de sincronización.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Ya había otra pasada en curso.
    Skipped,
    NoFiles,
    UpToDate,
    Changed(MergeSummary),
}

impl SyncOutcome {
    pub fn message(&self, locale: Locale) -> String {
        let messages = locale.messages();
        match self {
            Self::Skipped => String::new(),
            Self::NoFiles => messages.no_text_files.to_string(),
            Self::UpToDate => messages.files_up_to_date.to_string(),
            Self::Changed(summary) => locale.sync_changed(summary.added, summary.updated),
        }
    }
}

pub fn is_supported_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SYNC_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Lee recursivamente los ficheros soportados de `root`. El nombre de cada
/// documento es su ruta relativa con `/` como separador.
pub fn scan_directory(root: &Path) -> Result<Vec<Document>> {
    if !root.is_dir() {
        return Err(anyhow!("La ruta no es un directorio: {}", root.display()));
    }

    let mut entries: Vec<_> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Entrada ilegible durante la sincronización: {}", err);
                None
            }
        })
        .filter(|e| e.file_type().is_file() && is_supported_file(e.path()))
        .collect();
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    let mut docs = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = entry.path();
        let name = relative_name(root, path)?;
        match fs::read_to_string(path) {
            Ok(content) => docs.push(Document::new(name, content)),
            Err(e) => warn!("Fichero omitido {}: {}", path.display(), e),
        }
    }
    Ok(docs)
}

fn relative_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} no está dentro de {}", path.display(), root.display()))?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Estado de la sincronización de carpeta.
#[derive(Clone)]
pub struct FolderSync {
    root: Arc<Mutex<Option<PathBuf>>>,
    running: Arc<AtomicBool>,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
    repo: Arc<Mutex<DocumentRepository>>,
    status: Arc<Mutex<Status>>,
    locale: Locale,
}

/// Libera la marca de "en curso" al salir de la pasada, también si falla.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FolderSync {
    pub fn new(
        repo: Arc<Mutex<DocumentRepository>>,
        status: Arc<Mutex<Status>>,
        locale: Locale,
    ) -> Self {
        Self {
            root: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            timer: Arc::new(Mutex::new(None)),
            repo,
            status,
            locale,
        }
    }

    pub fn root(&self) -> Option<PathBuf> {
        lock(&self.root).clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Fija la carpeta, hace la primera pasada (visible) y arranca el temporizador.
    pub async fn start(&self, root: PathBuf, interval: Duration) -> Result<SyncOutcome> {
        if !root.is_dir() {
            return Err(anyhow!("La ruta no es un directorio: {}", root.display()));
        }
        self.stop();
        *lock(&self.root) = Some(root.clone());
        info!("Sincronizando con la carpeta {}", root.display());

        let outcome = self.run_once(false).await?;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // El primer tick es inmediato y la primera pasada ya se hizo.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = this.run_once(true).await {
                    error!("Error en la sincronización automática: {:#}", e);
                }
            }
        });
        *lock(&self.timer) = Some(handle);
        Ok(outcome)
    }

    /// Detiene la sincronización automática y olvida la carpeta.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.abort();
            info!("Sincronización automática detenida.");
        }
        *lock(&self.root) = None;
    }

    /// Una pasada de sincronización. Si ya hay otra en curso devuelve `Skipped`.
    pub async fn run_once(&self, silent: bool) -> Result<SyncOutcome> {
        let Some(root) = self.root() else {
            return Err(anyhow!("No hay carpeta de sincronización seleccionada"));
        };
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Sincronización anterior aún en curso; se omite esta pasada.");
            return Ok(SyncOutcome::Skipped);
        }
        let _guard = RunningGuard(&self.running);

        if !silent {
            self.set_status(true, format!("Sincronizando {}...", root.display()), 0.0);
        }

        let scan_root = root.clone();
        let scanned = tokio::task::spawn_blocking(move || scan_directory(&scan_root)).await?;
        let scanned = match scanned {
            Ok(docs) => docs,
            Err(e) => {
                let message = self.locale.messages().sync_error.to_string();
                self.set_status(false, message, 0.0);
                return Err(e);
            }
        };

        let outcome = if scanned.is_empty() {
            SyncOutcome::NoFiles
        } else {
            let summary = lock(&self.repo).merge(scanned)?;
            if summary.changed() {
                SyncOutcome::Changed(summary)
            } else {
                SyncOutcome::UpToDate
            }
        };

        match (&outcome, silent) {
            (SyncOutcome::Skipped, _) => {}
            (SyncOutcome::Changed(s), true) => {
                info!("Auto-sync: {} añadidos, {} actualizados", s.added, s.updated);
                self.set_status(false, outcome.message(self.locale), 1.0);
            }
            (_, false) => self.set_status(false, outcome.message(self.locale), 1.0),
            _ => {}
        }
        Ok(outcome)
    }

    fn set_status(&self, is_busy: bool, message: String, progress: f32) {
        let mut status = lock(&self.status);
        status.is_busy = is_busy;
        status.message = message;
        status.progress = progress;
    }
}
