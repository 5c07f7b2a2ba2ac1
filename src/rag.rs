//! Flujo de una pregunta:
//!   1. Unión de documentos persistentes y efímeros.
//!   2. Recuperación por palabras clave (o los más recientes si no hay coincidencias).
//!   3. Construcción del prompt en el idioma del proceso.
//!   4. Envío al backend del modelo y reenvío de las instantáneas.
//!
//! Los fallos del adaptador nunca se pierden: terminan como un evento
//! `Failed` con el texto localizado que el usuario ve como respuesta.

use std::pin::Pin;

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    llm::{LlmError, LlmManager},
    locale::Locale,
    models::Document,
    prompt::build_prompt,
    retrieval::{select_context, DEFAULT_TOP_K},
    store::CredentialStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerEvent {
    /// Texto acumulado de la respuesta.
    Snapshot { text: String },
    Failed {
        message: String,
        credential_evicted: bool,
    },
    Done,
}

pub type AnswerStream = Pin<Box<dyn Stream<Item = AnswerEvent> + Send>>;

/// Una pregunta ya validada.
#[derive(Debug, Clone)]
pub struct Question {
    pub text: String,
    pub model_id: String,
    /// Key enviada con la pregunta; si falta se usa la guardada.
    pub api_key: Option<String>,
}

#[derive(Clone)]
pub struct RagPipeline {
    llm: LlmManager,
    credentials: CredentialStore,
    locale: Locale,
}

impl RagPipeline {
    pub fn new(llm: LlmManager, credentials: CredentialStore, locale: Locale) -> Self {
        Self {
            llm,
            credentials,
            locale,
        }
    }

    /// Responde `question` usando `documents` (persistentes + efímeros, en ese orden).
    /// El stream siempre termina con `Done`.
    pub fn answer(&self, question: Question, documents: Vec<Document>) -> AnswerStream {
        let selection = select_context(&question.text, &documents, DEFAULT_TOP_K);
        info!(
            "Pregunta con {} documentos de contexto (fallback: {}), modelo {}",
            selection.documents.len(),
            selection.fallback,
            question.model_id
        );
        let prompt = build_prompt(&question.text, &selection.documents, self.locale);

        let api_key = question
            .api_key
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.credentials.get());
        let mut snapshots = self
            .llm
            .send_prompt(prompt, &question.model_id, api_key.as_deref());

        let this = self.clone();
        let stream = stream! {
            while let Some(item) = snapshots.next().await {
                match item {
                    Ok(text) => yield AnswerEvent::Snapshot { text },
                    Err(e) => {
                        yield this.failure(e);
                        break;
                    }
                }
            }
            yield AnswerEvent::Done;
        };
        Box::pin(stream)
    }

    fn failure(&self, err: LlmError) -> AnswerEvent {
        if let LlmError::AllCandidatesExhausted { attempts, .. } = &err {
            for attempt in attempts {
                warn!("Candidato {} descartado: {}", attempt.model, attempt.error);
            }
        }
        error!("Error del modelo: {}", err);

        let mut credential_evicted = false;
        if err.evicts_credential() {
            match self.credentials.evict() {
                Ok(_) => credential_evicted = true,
                Err(e) => error!("No se pudo eliminar la API key: {:#}", e),
            }
        }

        let detail = match &err {
            LlmError::MissingCredential { .. } => self.locale.messages().missing_api_key.to_string(),
            LlmError::InvalidCredential { status, .. } => self.locale.invalid_credential(*status),
            other => other.to_string(),
        };
        AnswerEvent::Failed {
            message: self.locale.error_answer(&detail),
            credential_evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::LlmEndpoints, store::KvStore};

    fn pipeline(locale: Locale) -> (RagPipeline, CredentialStore) {
        let credentials = CredentialStore::new(KvStore::in_memory());
        let llm = LlmManager::new(LlmEndpoints::default()).unwrap();
        (RagPipeline::new(llm, credentials.clone(), locale), credentials)
    }

    #[tokio::test]
    async fn gemini_without_key_fails_with_localized_message() {
        let (rag, _) = pipeline(Locale::En);
        let question = Question {
            text: "hola".to_string(),
            model_id: "gemini-flash".to_string(),
            api_key: Some("  ".to_string()),
        };
        let events: Vec<_> = rag.answer(question, Vec::new()).collect().await;
        assert_eq!(
            events,
            vec![
                AnswerEvent::Failed {
                    message: format!("❌ Error occurred: {}", Locale::En.messages().missing_api_key),
                    credential_evicted: false,
                },
                AnswerEvent::Done,
            ]
        );
    }

    #[test]
    fn answer_events_serialize_with_type_tag() {
        let json = serde_json::to_value(AnswerEvent::Snapshot { text: "a".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "snapshot", "text": "a"}));
        let json = serde_json::to_value(AnswerEvent::Done).unwrap();
        assert_eq!(json, serde_json::json!({"type": "done"}));
    }

    #[test]
    fn invalid_credential_evicts_saved_key() {
        let (rag, credentials) = pipeline(Locale::Ja);
        credentials.save("clave-vieja").unwrap();
        let event = rag.failure(LlmError::InvalidCredential {
            status: 403,
            body: "denied".into(),
        });
        match event {
            AnswerEvent::Failed { message, credential_evicted } => {
                assert!(credential_evicted);
                assert!(message.starts_with("❌ エラーが発生しました: APIキーが無効"));
                assert!(message.contains("403"));
            }
            other => panic!("evento inesperado: {other:?}"),
        }
        assert!(credentials.get().is_none());
    }
}
