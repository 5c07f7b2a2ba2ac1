//! Modelos de dominio (documentos de texto y metadatos del sistema de archivos).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Documento de texto que puede usarse como fuente RAG.
/// El nombre identifica el documento dentro de su lista, pero no se
/// garantiza que sea único globalmente.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    #[serde(default)]
    pub content: String,
}

impl Document {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Documento recuperado junto con su puntuación de relevancia.
/// La puntuación sólo existe durante la recuperación; nunca se persiste.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoredDocument {
    pub name: String,
    pub content: String,
    pub score: usize,
}

impl ScoredDocument {
    pub fn from_document(doc: &Document, score: usize) -> Self {
        Self {
            name: doc.name.clone(),
            content: doc.content.clone(),
            score,
        }
    }
}

/// Nodo del árbol de directorios que se muestra al elegir la carpeta a sincronizar.
#[derive(Debug, Clone, Serialize)]
pub struct FileTreeNode {
    pub path: PathBuf,
    pub name: String,
    pub is_dir: bool,
    pub children: Vec<FileTreeNode>,
}
