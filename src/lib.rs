//! Asistente RAG local: documentos personales (subidos, sincronizados desde
//! una carpeta u obtenidos por OCR) consultados con modelos Ollama, Sarasina o Gemini.

pub mod api;
pub mod app_state;
pub mod config;
pub mod llm;
pub mod locale;
pub mod models;
pub mod ocr;
pub mod prompt;
pub mod rag;
pub mod retrieval;
pub mod session;
pub mod store;
pub mod sync;
