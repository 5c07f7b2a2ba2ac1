//! OCR de imágenes pegadas.
//!
//! El motor produce una secuencia finita de eventos de progreso que termina en
//! el texto reconocido (o en un error). `OcrSlot` garantiza que sólo haya un
//! trabajo en curso: un segundo intento mientras otro corre se rechaza.

use std::{
    path::PathBuf,
    pin::Pin,
    process::Stdio,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use async_stream::try_stream;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command, sync::OnceCell, task::JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrPhase {
    Download,
    Load,
    Initialize,
    LanguageLoad,
    Recognize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcrEvent {
    Progress { phase: OcrPhase, percent: u8 },
    Completed(String),
}

pub type OcrEventStream = Pin<Box<dyn Stream<Item = Result<OcrEvent>> + Send>>;

/// Motor OCR. Cada llamada produce un stream nuevo; no se puede reiniciar.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image: Vec<u8>) -> OcrEventStream;
}

/// Motor basado en el binario `tesseract`. La comprobación del binario se hace
/// una sola vez, en el primer trabajo.
#[derive(Clone)]
pub struct TesseractCli {
    binary: PathBuf,
    languages: String,
    ready: Arc<OnceCell<()>>,
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new("tesseract", "jpn+eng")
    }
}

impl TesseractCli {
    pub fn new(binary: impl Into<PathBuf>, languages: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            languages: languages.into(),
            ready: Arc::new(OnceCell::new()),
        }
    }

    async fn initialize(&self) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg("--list-langs")
            .output()
            .await
            .with_context(|| format!("No se pudo ejecutar {}", self.binary.display()))?;
        if !output.status.success() {
            return Err(anyhow!("{} --list-langs terminó con {}", self.binary.display(), output.status));
        }
        // tesseract escribe la lista en stdout o stderr según la versión.
        let listed = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        for lang in self.languages.split('+') {
            if !listed.lines().any(|l| l.trim() == lang) {
                warn!("Datos de idioma '{}' no instalados para tesseract.", lang);
            }
        }
        info!("Motor OCR inicializado ({}).", self.languages);
        Ok(())
    }

    async fn run(&self, image: Vec<u8>) -> Result<String> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", self.languages.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("No se pudo lanzar {}", self.binary.display()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin de tesseract no disponible"))?;
        let writer = tokio::spawn(async move {
            stdin.write_all(&image).await?;
            stdin.shutdown().await
        });

        let output = child.wait_with_output().await?;
        writer.await??;
        if !output.status.success() {
            return Err(anyhow!(
                "tesseract terminó con {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl OcrEngine for TesseractCli {
    fn recognize(&self, image: Vec<u8>) -> OcrEventStream {
        let this = self.clone();
        let stream = try_stream! {
            if !this.ready.initialized() {
                yield OcrEvent::Progress { phase: OcrPhase::Load, percent: 0 };
                this.ready.get_or_try_init(|| this.initialize()).await?;
                yield OcrEvent::Progress { phase: OcrPhase::Initialize, percent: 100 };
                yield OcrEvent::Progress { phase: OcrPhase::LanguageLoad, percent: 100 };
            }
            yield OcrEvent::Progress { phase: OcrPhase::Recognize, percent: 0 };
            let text = this.run(image).await?;
            yield OcrEvent::Progress { phase: OcrPhase::Recognize, percent: 100 };
            yield OcrEvent::Completed(text);
        };
        Box::pin(stream)
    }
}

/// Decodifica una imagen pegada (`data:image/png;base64,...` o base64 pelado).
pub fn decode_data_url(data: &str) -> Result<Vec<u8>> {
    let payload = match data.split_once(',') {
        Some((header, payload)) if header.starts_with("data:") => {
            if !header.ends_with(";base64") {
                return Err(anyhow!("La imagen pegada no está codificada en base64"));
            }
            payload
        }
        _ => data,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .context("La imagen pegada no es base64 válido")?;
    if bytes.is_empty() {
        return Err(anyhow!("La imagen pegada está vacía"));
    }
    Ok(bytes)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OcrError {
    #[error("an OCR job is already running")]
    Busy,
    #[error("OCR failed: {0}")]
    Engine(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OcrJobState {
    Idle,
    Running {
        job_id: Uuid,
        phase: Option<OcrPhase>,
        percent: u8,
    },
    Done {
        job_id: Uuid,
        /// Documento efímero creado; `None` si no se detectó texto.
        document: Option<String>,
    },
    Failed {
        job_id: Uuid,
        error: String,
    },
}

/// Ranura de un único trabajo OCR: `Idle | Running | Done | Failed`.
#[derive(Clone, Debug)]
pub struct OcrSlot {
    state: Arc<Mutex<OcrJobState>>,
}

impl Default for OcrSlot {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(OcrJobState::Idle)),
        }
    }
}

impl OcrSlot {
    pub fn state(&self) -> OcrJobState {
        self.lock().clone()
    }

    /// Reserva la ranura. Falla con `Busy` si ya hay un trabajo en curso.
    pub fn try_begin(&self) -> Result<Uuid, OcrError> {
        let mut state = self.lock();
        if matches!(*state, OcrJobState::Running { .. }) {
            return Err(OcrError::Busy);
        }
        let job_id = Uuid::new_v4();
        *state = OcrJobState::Running {
            job_id,
            phase: None,
            percent: 0,
        };
        Ok(job_id)
    }

    /// Reserva la ranura y lanza el trabajo en segundo plano.
    pub fn spawn<F>(
        &self,
        engine: Arc<dyn OcrEngine>,
        image: Vec<u8>,
        on_text: F,
    ) -> Result<(Uuid, JoinHandle<()>), OcrError>
    where
        F: FnOnce(String) -> Option<String> + Send + 'static,
    {
        let job_id = self.try_begin()?;
        Ok((job_id, self.run(job_id, engine, image, on_text)))
    }

    /// Ejecuta un trabajo ya reservado con `try_begin`. `on_text` recibe el
    /// texto reconocido y devuelve el nombre del documento efímero creado, si lo hubo.
    pub fn run<F>(
        &self,
        job_id: Uuid,
        engine: Arc<dyn OcrEngine>,
        image: Vec<u8>,
        on_text: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(String) -> Option<String> + Send + 'static,
    {
        let slot = self.clone();
        tokio::spawn(async move {
            match slot.drive(job_id, engine.recognize(image)).await {
                Ok(text) => {
                    let document = on_text(text);
                    slot.set(OcrJobState::Done { job_id, document });
                }
                Err(e) => {
                    error!("Error OCR: {}", e);
                    slot.set(OcrJobState::Failed {
                        job_id,
                        error: e.to_string(),
                    });
                }
            }
        })
    }

    /// Consume los eventos del motor actualizando el progreso.
    async fn drive(&self, job_id: Uuid, mut events: OcrEventStream) -> Result<String, OcrError> {
        while let Some(event) = events.next().await {
            match event.map_err(|e| OcrError::Engine(format!("{e:#}")))? {
                OcrEvent::Progress { phase, percent } => {
                    self.set(OcrJobState::Running {
                        job_id,
                        phase: Some(phase),
                        percent: percent.min(100),
                    });
                }
                OcrEvent::Completed(text) => return Ok(text),
            }
        }
        Err(OcrError::Engine("el motor terminó sin devolver texto".to_string()))
    }

    fn set(&self, next: OcrJobState) {
        *self.lock() = next;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OcrJobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
