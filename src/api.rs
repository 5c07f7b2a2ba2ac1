use std::{
    convert::Infallible,
    path::{Path, PathBuf},
};

use axum::{
    extract::{DefaultBodyLimit, Json, Path as UrlPath, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post, put},
    Router,
};
use chrono::Local;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::{
    app_state::{lock, AppState, Status},
    locale::{Locale, Messages},
    models::{Document, FileTreeNode},
    ocr::{decode_data_url, OcrError, OcrJobState},
    rag::{AnswerEvent, Question},
    session::pasted_image_name,
    sync::SyncOutcome,
};

/// Tamaño máximo de cada fichero subido (10 MiB).
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
/// Caracteres mostrados en la vista previa de cada documento.
const PREVIEW_CHARS: usize = 300;
const PREVIEW_DOCS: usize = 5;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

// --- Payloads y respuestas de la API ---

#[derive(Deserialize)]
pub struct SelectDirPayload {
    path: String,
}

#[derive(Deserialize)]
pub struct AskPayload {
    question: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Deserialize)]
pub struct UploadPayload {
    files: Vec<Document>,
}

#[derive(Deserialize)]
pub struct RenamePayload {
    name: String,
}

#[derive(Deserialize)]
pub struct PasteTextPayload {
    text: String,
}

#[derive(Deserialize)]
pub struct OcrPayload {
    /// Data URL (`data:image/png;base64,...`).
    image: String,
}

#[derive(Deserialize)]
pub struct ApiKeyPayload {
    api_key: String,
}

#[derive(Serialize)]
pub struct ConfigResponse {
    locale: Locale,
    default_model: String,
    messages: &'static Messages,
}

#[derive(Serialize)]
pub struct DocumentSummary {
    index: usize,
    name: String,
    chars: usize,
}

#[derive(Serialize)]
pub struct DocumentPreview {
    name: String,
    excerpt: String,
    truncated: bool,
}

#[derive(Serialize)]
pub struct EphemeralSummary {
    ocr_documents: Vec<String>,
    has_pasted_text: bool,
}

#[derive(Serialize)]
pub struct DocumentsResponse {
    documents: Vec<DocumentSummary>,
    preview: Vec<DocumentPreview>,
    ephemeral: EphemeralSummary,
}

#[derive(Serialize)]
pub struct UploadResponse {
    added: usize,
    skipped: Vec<String>,
    message: String,
}

#[derive(Serialize)]
pub struct SyncResponse {
    root: String,
    outcome: SyncOutcome,
    message: String,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/config", get(config_handler))
        .route("/api/documents", get(list_documents_handler).post(upload_handler))
        .route("/api/documents/reset", post(reset_handler))
        .route(
            "/api/documents/:index",
            get(get_document_handler).delete(delete_document_handler),
        )
        .route("/api/documents/:index/rename", post(rename_document_handler))
        .route("/api/paste-text", put(paste_text_handler))
        .route("/api/memo", post(memo_handler))
        .route("/api/ocr", get(ocr_state_handler).post(ocr_handler))
        .route("/api/list-directory", post(list_directory_handler))
        .route("/api/sync", post(start_sync_handler).delete(stop_sync_handler))
        .route("/api/status", get(status_handler))
        .route(
            "/api/api-key",
            get(api_key_state_handler)
                .post(save_api_key_handler)
                .delete(delete_api_key_handler),
        )
        .route("/api/ask", post(ask_handler))
        .route("/api/shutdown", post(shutdown_handler))
        // Varias subidas de hasta 10 MiB en una sola petición.
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn config_handler(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        locale: state.config.locale,
        default_model: state.config.default_model.clone(),
        messages: state.config.locale.messages(),
    })
}

#[axum::debug_handler]
async fn list_documents_handler(State(state): State<AppState>) -> Json<DocumentsResponse> {
    let repo = lock(&state.documents);
    let session = lock(&state.session);

    let documents = repo
        .list()
        .iter()
        .enumerate()
        .map(|(index, doc)| DocumentSummary {
            index,
            name: doc.name.clone(),
            chars: doc.content.chars().count(),
        })
        .collect();

    let preview = repo
        .recent(PREVIEW_DOCS)
        .into_iter()
        .map(|doc| {
            let excerpt: String = doc.content.chars().take(PREVIEW_CHARS).collect();
            DocumentPreview {
                name: doc.name.clone(),
                truncated: excerpt.len() < doc.content.len(),
                excerpt,
            }
        })
        .collect();

    Json(DocumentsResponse {
        documents,
        preview,
        ephemeral: EphemeralSummary {
            ocr_documents: session.ocr_documents().iter().map(|d| d.name.clone()).collect(),
            has_pasted_text: !session.pasted_text().trim().is_empty(),
        },
    })
}

#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    Json(payload): Json<UploadPayload>,
) -> Result<Json<UploadResponse>, ApiError> {
    let (accepted, rejected): (Vec<_>, Vec<_>) = payload
        .files
        .into_iter()
        .partition(|file| file.content.len() <= MAX_UPLOAD_BYTES);

    let skipped: Vec<String> = rejected.into_iter().map(|file| file.name).collect();
    for name in &skipped {
        warn!("Fichero omitido por superar 10MB: {}", name);
    }

    let added = lock(&state.documents)
        .add_many(accepted)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;
    info!("{} ficheros añadidos, {} omitidos.", added, skipped.len());

    Ok(Json(UploadResponse {
        added,
        message: state.config.locale.files_added(added, skipped.len()),
        skipped,
    }))
}

#[axum::debug_handler]
async fn get_document_handler(
    State(state): State<AppState>,
    UrlPath(index): UrlPath<usize>,
) -> Result<Json<Document>, ApiError> {
    lock(&state.documents)
        .get(index)
        .cloned()
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("No existe el documento {index}")))
}

#[axum::debug_handler]
async fn delete_document_handler(
    State(state): State<AppState>,
    UrlPath(index): UrlPath<usize>,
) -> Result<Json<Document>, ApiError> {
    let mut repo = lock(&state.documents);
    if repo.get(index).is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("No existe el documento {index}")));
    }
    let removed = repo
        .delete(index)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;
    info!("Documento eliminado: {}", removed.name);
    Ok(Json(removed))
}

#[axum::debug_handler]
async fn rename_document_handler(
    State(state): State<AppState>,
    UrlPath(index): UrlPath<usize>,
    Json(payload): Json<RenamePayload>,
) -> Result<Json<Value>, ApiError> {
    let mut repo = lock(&state.documents);
    if repo.get(index).is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("No existe el documento {index}")));
    }
    let renamed = repo
        .rename(index, &payload.name)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;
    Ok(Json(json!({ "renamed": renamed })))
}

#[axum::debug_handler]
async fn reset_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.folder_sync.stop();
    lock(&state.session).clear();
    lock(&state.documents)
        .clear()
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;

    let message = state.config.locale.messages().reset_done;
    {
        let mut status = lock(&state.status);
        status.is_busy = false;
        status.message = message.to_string();
        status.progress = 0.0;
    }
    info!("Documentos RAG reseteados.");
    Ok(Json(json!({ "message": message })))
}

#[axum::debug_handler]
async fn paste_text_handler(
    State(state): State<AppState>,
    Json(payload): Json<PasteTextPayload>,
) -> StatusCode {
    lock(&state.session).set_pasted_text(payload.text);
    StatusCode::NO_CONTENT
}

#[axum::debug_handler]
async fn memo_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let locale = state.config.locale;
    let mut repo = lock(&state.documents);
    let mut session = lock(&state.session);
    let memo = session
        .persist_as_memo(&mut repo, locale, Local::now())
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    info!("Memo guardado: {}", memo.name);
    Ok(Json(json!({
        "message": locale.memo_saved(&memo.name),
        "document": memo,
    })))
}

#[axum::debug_handler]
async fn ocr_handler(
    State(state): State<AppState>,
    Json(payload): Json<OcrPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let image = decode_data_url(&payload.image).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    // La ranura se reserva antes de tocar la sesión: un pegado rechazado no borra nada.
    let job_id = state.ocr.try_begin().map_err(|e| match e {
        OcrError::Busy => api_error(StatusCode::CONFLICT, e),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other),
    })?;

    lock(&state.session).begin_image_paste();
    let session = state.session.clone();
    let locale = state.config.locale;
    state.ocr.run(job_id, state.ocr_engine.clone(), image, move |text| {
        let text = text.trim();
        if text.is_empty() {
            info!("OCR sin texto detectado.");
            return None;
        }
        let name = pasted_image_name(locale, Local::now());
        lock(&session).add_ocr_document(Document::new(name.clone(), text));
        Some(name)
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

#[axum::debug_handler]
async fn ocr_state_handler(State(state): State<AppState>) -> Json<OcrJobState> {
    Json(state.ocr.state())
}

#[axum::debug_handler]
async fn list_directory_handler(
    Json(payload): Json<SelectDirPayload>,
) -> Result<Json<FileTreeNode>, ApiError> {
    let path = if payload.path.is_empty() {
        dirs::home_dir().ok_or_else(|| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "No se pudo determinar el directorio home del usuario.",
            )
        })?
    } else {
        PathBuf::from(&payload.path)
    };

    if !path.is_dir() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "La ruta proporcionada no es un directorio válido.",
        ));
    }

    build_file_tree(&path).map(Json).map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error al leer el directorio: {}", e),
        )
    })
}

#[axum::debug_handler]
async fn start_sync_handler(
    State(state): State<AppState>,
    Json(payload): Json<SelectDirPayload>,
) -> Result<Json<SyncResponse>, ApiError> {
    let root = PathBuf::from(&payload.path);
    if !root.is_dir() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "La ruta proporcionada no es un directorio válido.",
        ));
    }

    match state.folder_sync.start(root.clone(), state.config.sync_interval).await {
        Ok(outcome) => Ok(Json(SyncResponse {
            root: root.to_string_lossy().to_string(),
            message: outcome.message(state.config.locale),
            outcome,
        })),
        Err(e) => {
            error!("Error de sincronización: {:#}", e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                state.config.locale.messages().sync_error,
            ))
        }
    }
}

#[axum::debug_handler]
async fn stop_sync_handler(State(state): State<AppState>) -> StatusCode {
    state.folder_sync.stop();
    StatusCode::NO_CONTENT
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(lock(&state.status).clone())
}

#[axum::debug_handler]
async fn api_key_state_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "present": state.credentials.get().is_some() }))
}

#[axum::debug_handler]
async fn save_api_key_handler(
    State(state): State<AppState>,
    Json(payload): Json<ApiKeyPayload>,
) -> Result<StatusCode, ApiError> {
    state
        .credentials
        .save(&payload.api_key)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn delete_api_key_handler(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state
        .credentials
        .evict()
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn ask_handler(
    State(state): State<AppState>,
    Json(payload): Json<AskPayload>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let messages = state.config.locale.messages();
    let question = payload.question.trim().to_string();
    if question.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, messages.empty_question));
    }
    let guard = state
        .requests
        .try_acquire()
        .ok_or_else(|| api_error(StatusCode::CONFLICT, messages.request_in_flight))?;

    let api_key = payload.api_key.filter(|k| !k.trim().is_empty());
    if let Some(key) = &api_key {
        if let Err(e) = state.credentials.save(key) {
            warn!("No se pudo guardar la API key: {:#}", e);
        }
    }

    let documents = {
        let repo = lock(&state.documents);
        let session = lock(&state.session);
        session.all_documents(repo.list(), state.config.locale)
    };
    let model_id = payload
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.config.default_model.clone());

    let mut answers = state.rag.answer(
        Question {
            text: question,
            model_id,
            api_key,
        },
        documents,
    );

    let stream = async_stream::stream! {
        // La ranura se libera al terminar o al cerrar el cliente la conexión.
        let _guard = guard;
        while let Some(event) = answers.next().await {
            yield Ok(sse_event(&event));
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &AnswerEvent) -> Event {
    let name = match event {
        AnswerEvent::Snapshot { .. } => "snapshot",
        AnswerEvent::Failed { .. } => "error",
        AnswerEvent::Done => "done",
    };
    Event::default()
        .event(name)
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event(name))
}

// --- Handler de apagado y utilidades ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    state.folder_sync.stop();
    if let Some(sender) = lock(&state.shutdown_sender).take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}

fn build_file_tree(path: &Path) -> std::io::Result<FileTreeNode> {
    let metadata = std::fs::metadata(path)?;
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());

    let is_dir = metadata.is_dir();
    let mut children = Vec::new();

    if is_dir {
        let mut entries: Vec<_> = std::fs::read_dir(path)?.filter_map(Result::ok).collect();

        entries.sort_by(|a, b| {
            let a_is_dir = a.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
            let b_is_dir = b.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
            b_is_dir.cmp(&a_is_dir).then_with(|| a.file_name().cmp(&b.file_name()))
        });

        for entry in entries {
            if let Ok(entry_meta) = entry.metadata() {
                children.push(FileTreeNode {
                    path: entry.path(),
                    name: entry.file_name().to_string_lossy().to_string(),
                    is_dir: entry_meta.is_dir(),
                    children: Vec::new(),
                });
            }
        }
    }

    Ok(FileTreeNode {
        path: path.to_path_buf(),
        name,
        is_dir,
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_tree_lists_directories_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("zeta")).unwrap();

        let tree = build_file_tree(dir.path()).unwrap();
        assert!(tree.is_dir);
        let names: Vec<_> = tree.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "a.txt"]);
        assert!(tree.children[0].is_dir);
    }
}
