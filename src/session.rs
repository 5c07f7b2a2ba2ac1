//! Documentos efímeros de la sesión: textos obtenidos por OCR y el área de
//! texto pegado. Se descartan al pegar una imagen nueva, al persistirlos o al
//! resetear.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};

use crate::{locale::Locale, models::Document, store::DocumentRepository};

#[derive(Debug, Default)]
pub struct Session {
    ocr_documents: Vec<Document>,
    pasted_text: String,
}

impl Session {
    pub fn ocr_documents(&self) -> &[Document] {
        &self.ocr_documents
    }

    pub fn pasted_text(&self) -> &str {
        &self.pasted_text
    }

    pub fn set_pasted_text(&mut self, text: impl Into<String>) {
        self.pasted_text = text.into();
    }

    /// Se pega una imagen nueva: se descartan los OCR anteriores y el texto pegado.
    pub fn begin_image_paste(&mut self) {
        self.ocr_documents.clear();
        self.pasted_text.clear();
    }

    pub fn add_ocr_document(&mut self, doc: Document) {
        self.ocr_documents.push(doc);
    }

    pub fn clear(&mut self) {
        self.ocr_documents.clear();
        self.pasted_text.clear();
    }

    /// Todos los documentos consultables: persistentes, OCR y el texto pegado
    /// (como un único documento), en ese orden.
    pub fn all_documents(&self, persistent: &[Document], locale: Locale) -> Vec<Document> {
        let mut docs = Vec::with_capacity(persistent.len() + self.ocr_documents.len() + 1);
        docs.extend_from_slice(persistent);
        docs.extend(self.ocr_documents.iter().cloned());
        let pasted = self.pasted_text.trim();
        if !pasted.is_empty() {
            docs.push(Document::new(locale.messages().pasted_text_document, pasted));
        }
        docs
    }

    /// Guarda los textos OCR y el texto pegado como un memo persistente
    /// `plower_memo_YYYYMMDD_HHMMSS.txt` y vacía las listas efímeras.
    pub fn persist_as_memo(
        &mut self,
        repo: &mut DocumentRepository,
        locale: Locale,
        now: DateTime<Local>,
    ) -> Result<Document> {
        let messages = locale.messages();
        let mut content = String::new();
        for doc in &self.ocr_documents {
            push_memo_block(&mut content, messages.file_name_label, &doc.name, &doc.content);
        }
        let pasted = self.pasted_text.trim();
        if !pasted.is_empty() {
            push_memo_block(&mut content, messages.file_name_label, messages.pasted_text_memo, pasted);
        }
        if content.trim().is_empty() {
            return Err(anyhow!(messages.nothing_to_save));
        }

        let memo = Document::new(memo_file_name(now), content);
        repo.add(memo.clone())?;
        self.clear();
        Ok(memo)
    }
}

fn push_memo_block(out: &mut String, label: &str, name: &str, content: &str) {
    out.push_str(&format!("--- {label}: {name} ---\n"));
    out.push_str(content);
    out.push_str("\n\n");
}

pub fn memo_file_name(now: DateTime<Local>) -> String {
    format!("plower_memo_{}.txt", now.format("%Y%m%d_%H%M%S"))
}

/// Nombre del documento efímero creado a partir de una imagen pegada.
pub fn pasted_image_name(locale: Locale, now: DateTime<Local>) -> String {
    format!("{}_{}", locale.messages().pasted_image_prefix, now.timestamp_millis())
}
