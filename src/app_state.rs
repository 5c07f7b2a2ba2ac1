use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

use anyhow::Result;
use tokio::sync::oneshot;

use crate::{
    config::AppConfig,
    llm::LlmManager,
    ocr::{OcrEngine, OcrSlot},
    rag::RagPipeline,
    session::Session,
    store::{CredentialStore, DocumentRepository, KvStore},
    sync::FolderSync,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub documents: Arc<Mutex<DocumentRepository>>,
    pub session: Arc<Mutex<Session>>,
    pub credentials: CredentialStore,
    pub rag: RagPipeline,
    pub ocr: OcrSlot,
    pub ocr_engine: Arc<dyn OcrEngine>,
    pub folder_sync: FolderSync,
    pub status: Arc<Mutex<Status>>,
    pub requests: RequestSlot,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: KvStore,
        ocr_engine: Arc<dyn OcrEngine>,
        shutdown_sender: Option<oneshot::Sender<()>>,
    ) -> Result<Self> {
        let llm_manager = LlmManager::from_config(&config)?;
        let credentials = CredentialStore::new(store.clone());
        let rag = RagPipeline::new(llm_manager, credentials.clone(), config.locale);
        let documents = Arc::new(Mutex::new(DocumentRepository::load(store.clone())));
        let status = Arc::new(Mutex::new(Status {
            is_busy: false,
            message: "Servidor listo.".to_string(),
            progress: 0.0,
        }));
        let folder_sync = FolderSync::new(documents.clone(), status.clone(), config.locale);

        Ok(Self {
            documents,
            session: Arc::new(Mutex::new(Session::default())),
            credentials,
            rag,
            ocr: OcrSlot::default(),
            ocr_engine,
            folder_sync,
            status,
            requests: RequestSlot::default(),
            shutdown_sender: Arc::new(Mutex::new(shutdown_sender)),
            config,
        })
    }
}

/// Bloquea un mutex compartido aunque otro hilo haya entrado en pánico con él.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}

/// Una sola pregunta en vuelo a la vez (`Idle | InFlight`).
#[derive(Debug, Clone, Default)]
pub struct RequestSlot {
    in_flight: Arc<AtomicBool>,
}

/// Mientras exista, la ranura está ocupada.
#[derive(Debug)]
pub struct RequestGuard {
    in_flight: Arc<AtomicBool>,
}

impl RequestSlot {
    /// Ocupa la ranura, o `None` si ya hay una petición en curso.
    pub fn try_acquire(&self) -> Option<RequestGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RequestGuard {
                in_flight: self.in_flight.clone(),
            })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_slot_admits_one_at_a_time() {
        let slot = RequestSlot::default();
        let guard = slot.try_acquire().unwrap();
        assert!(slot.is_in_flight());
        assert!(slot.try_acquire().is_none());
        drop(guard);
        assert!(!slot.is_in_flight());
        assert!(slot.clone().try_acquire().is_some());
    }
}
