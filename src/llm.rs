//! Adaptador de protocolo para los tres tipos de backend de modelos.
//!
//! - Gemini (nube): cadena de modelos candidatos, respuesta síncrona.
//! - Sarasina (proxy local): una petición síncrona.
//! - Ollama (local): respuesta en streaming como JSON delimitado por líneas.
//!
//! Todos se normalizan a una secuencia de "instantáneas": el texto acumulado
//! de la respuesta hasta el momento. La última instantánea es la respuesta final.

use std::{pin::Pin, time::Duration};

use async_stream::try_stream;
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, LlmEndpoints};

/// Temperatura fija para todos los backends.
pub const TEMPERATURE: f64 = 0.1;
/// Ventana de contexto de Ollama para modelos pequeños y grandes.
pub const SMALL_CONTEXT_WINDOW: u32 = 4096;
pub const LARGE_CONTEXT_WINDOW: u32 = 8192;
/// Marcas de tamaño en el nombre del modelo que activan la ventana grande.
const LARGE_MODEL_MARKERS: &[&str] = &["20b", "12b", "120b"];

/// Candidatos Gemini, en orden de preferencia.
pub const FLASH_CANDIDATES: &[&str] = &[
    "gemini-2.5-flash",
    "gemini-flash-lite",
    "gemini-2.0-flash-exp",
    "gemini-1.5-flash",
    "gemini-1.5-flash-002",
    "gemini-1.5-flash-001",
];
pub const PRO_CANDIDATES: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.0-pro-exp-02-05",
    "gemini-1.5-pro",
    "gemini-1.5-pro-002",
    "gemini-1.5-pro-001",
];

/// Máximo de caracteres del cuerpo de error que se incluyen en los mensajes.
const ERROR_BODY_PREVIEW: usize = 100;

/// Familia de backend, decidida por el nombre del modelo en cada petición.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    CloudFallbackChain,
    ProxySync,
    LocalStream,
}

/// `gemini*` → nube; contiene `sarasina` → proxy; cualquier otro → Ollama.
pub fn classify(model_id: &str) -> ProviderFamily {
    let id = model_id.to_lowercase();
    if id.starts_with("gemini") {
        ProviderFamily::CloudFallbackChain
    } else if id.contains("sarasina") {
        ProviderFamily::ProxySync
    } else {
        ProviderFamily::LocalStream
    }
}

/// Lista de candidatos según el nivel pedido (`flash` o pro).
pub fn gemini_candidates(model_id: &str) -> &'static [&'static str] {
    if model_id.to_lowercase().contains("flash") {
        FLASH_CANDIDATES
    } else {
        PRO_CANDIDATES
    }
}

/// `num_ctx` que se envía a Ollama.
pub fn context_window(model_id: &str) -> u32 {
    let id = model_id.to_lowercase();
    if LARGE_MODEL_MARKERS.iter().any(|marker| id.contains(marker)) {
        LARGE_CONTEXT_WINDOW
    } else {
        SMALL_CONTEXT_WINDOW
    }
}

/// Fallo de un candidato que se descartó antes de agotar la cadena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub model: String,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("an API key is required to use model {model}")]
    MissingCredential { model: String },

    #[error("Gemini API auth error ({status}): {body}")]
    InvalidCredential { status: u16, body: String },

    #[error("{provider} error: {status}. model: {model}. detail: {body}")]
    ProviderError {
        provider: &'static str,
        model: String,
        status: u16,
        body: String,
    },

    #[error("proxy processing error: {0}")]
    ProxyError(String),

    #[error("unexpected response format from {model}: {detail}")]
    MalformedResponse { model: String, detail: String },

    #[error("all candidate models failed. last error: {last}")]
    AllCandidatesExhausted {
        last: Box<LlmError>,
        attempts: Vec<CandidateFailure>,
    },

    #[error("could not reach {endpoint}: {source}")]
    TransportFailure {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
}

impl LlmError {
    /// Si el error obliga a descartar la API key guardada.
    pub fn evicts_credential(&self) -> bool {
        matches!(self, Self::InvalidCredential { .. })
    }

    fn transport(endpoint: &str, source: reqwest::Error) -> Self {
        Self::TransportFailure {
            endpoint: endpoint.to_string(),
            source,
        }
    }
}

/// Secuencia de instantáneas de la respuesta.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Capacidad común de los tres backends.
pub trait ModelBackend: Send + Sync {
    fn family(&self) -> ProviderFamily;
    fn send(&self, prompt: String) -> SnapshotStream;
}

/// Gestor de backends de modelos.
#[derive(Debug, Clone)]
pub struct LlmManager {
    client: reqwest::Client,
    endpoints: LlmEndpoints,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        Self::new(cfg.endpoints.clone())
    }

    pub fn new(endpoints: LlmEndpoints) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, endpoints })
    }

    /// Resuelve el backend para el modelo. Gemini sin API key falla aquí,
    /// antes de cualquier petición de red.
    pub fn backend_for(
        &self,
        model_id: &str,
        api_key: Option<&str>,
    ) -> Result<Box<dyn ModelBackend>, LlmError> {
        let family = classify(model_id);
        debug!("Modelo {} clasificado como {:?}", model_id, family);
        let backend: Box<dyn ModelBackend> = match family {
            ProviderFamily::CloudFallbackChain => {
                let api_key = api_key
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| LlmError::MissingCredential {
                        model: model_id.to_string(),
                    })?;
                Box::new(GeminiChain {
                    client: self.client.clone(),
                    base_url: self.endpoints.gemini_base_url.clone(),
                    api_key: api_key.to_string(),
                    candidates: gemini_candidates(model_id),
                    timeout: self.endpoints.request_timeout,
                })
            }
            ProviderFamily::ProxySync => Box::new(SarasinaProxy {
                client: self.client.clone(),
                endpoint: self.endpoints.sarasina_proxy_url.clone(),
                model: model_id.to_string(),
                timeout: self.endpoints.request_timeout,
            }),
            ProviderFamily::LocalStream => Box::new(OllamaStream {
                client: self.client.clone(),
                endpoint: self.endpoints.ollama_generate_url.clone(),
                model: model_id.to_string(),
            }),
        };
        Ok(backend)
    }

    /// Envía el prompt al backend que corresponda al modelo.
    pub fn send_prompt(&self, prompt: String, model_id: &str, api_key: Option<&str>) -> SnapshotStream {
        match self.backend_for(model_id, api_key) {
            Ok(backend) => backend.send(prompt),
            Err(e) => Box::pin(stream::once(async move { Err::<String, LlmError>(e) })),
        }
    }
}

// ---------------------------------------------------------------------
// GEMINI (nube, cadena de candidatos)
// ---------------------------------------------------------------------

#[derive(Clone)]
struct GeminiChain {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    candidates: &'static [&'static str],
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

impl GeminiChain {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": TEMPERATURE },
        });

        let mut attempts: Vec<CandidateFailure> = Vec::new();
        let mut last_error: Option<LlmError> = None;

        for version in self.candidates {
            info!("Probando modelo Gemini: {}", version);
            let endpoint = format!("{}/v1beta/models/{}:generateContent", self.base_url, version);

            let sent = self
                .client
                .post(&endpoint)
                .query(&[("key", self.api_key.as_str())])
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await;

            let outcome = match sent {
                Ok(response) => self.read_candidate(version, response).await,
                Err(e) => Err(CandidateError::Recoverable(LlmError::transport(&endpoint, e))),
            };

            match outcome {
                Ok(text) => {
                    info!("Respuesta obtenida de {}", version);
                    return Ok(text);
                }
                Err(CandidateError::Fatal(err)) => return Err(err),
                Err(CandidateError::Recoverable(err)) => {
                    warn!("Modelo {} falló ({}). Probando el siguiente...", version, err);
                    attempts.push(CandidateFailure {
                        model: version.to_string(),
                        error: err.to_string(),
                    });
                    last_error = Some(err);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| LlmError::MalformedResponse {
            model: "gemini".to_string(),
            detail: "no candidate models configured".to_string(),
        });
        Err(LlmError::AllCandidatesExhausted {
            last: Box::new(last),
            attempts,
        })
    }

    async fn read_candidate(
        &self,
        version: &str,
        response: reqwest::Response,
    ) -> Result<String, CandidateError> {
        let status = response.status();
        let endpoint = response.url().path().to_string();
        let text = response
            .text()
            .await
            .map_err(|e| CandidateError::Recoverable(LlmError::transport(&endpoint, e)))?;

        if !status.is_success() {
            let code = status.as_u16();
            return Err(match code {
                404 | 503 => CandidateError::Recoverable(LlmError::ProviderError {
                    provider: "Gemini API",
                    model: version.to_string(),
                    status: code,
                    body: preview(&text),
                }),
                400 | 403 => CandidateError::Fatal(LlmError::InvalidCredential {
                    status: code,
                    body: preview(&text),
                }),
                _ => CandidateError::Fatal(LlmError::ProviderError {
                    provider: "Gemini API",
                    model: version.to_string(),
                    status: code,
                    body: preview(&text),
                }),
            });
        }

        parse_gemini_text(version, &text).map_err(CandidateError::Recoverable)
    }
}

enum CandidateError {
    /// El siguiente candidato puede intentarse.
    Recoverable(LlmError),
    /// Aborta la cadena.
    Fatal(LlmError),
}

fn parse_gemini_text(version: &str, raw: &str) -> Result<String, LlmError> {
    let malformed = || LlmError::MalformedResponse {
        model: version.to_string(),
        detail: preview(raw),
    };
    let parsed: GeminiResponse = serde_json::from_str(raw).map_err(|_| malformed())?;
    let content = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .ok_or_else(malformed)?;
    Ok(content.parts.into_iter().map(|p| p.text).collect())
}

impl ModelBackend for GeminiChain {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::CloudFallbackChain
    }

    fn send(&self, prompt: String) -> SnapshotStream {
        let this = self.clone();
        Box::pin(stream::once(async move { this.generate(&prompt).await }))
    }
}

// ---------------------------------------------------------------------
// SARASINA (proxy local síncrono)
// ---------------------------------------------------------------------

#[derive(Clone)]
struct SarasinaProxy {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ProxyResponse {
    response: Option<String>,
    detail: Option<Value>,
}

impl SarasinaProxy {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "temperature": TEMPERATURE,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::transport(&self.endpoint, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::transport(&self.endpoint, e))?;
        if !status.is_success() {
            return Err(LlmError::ProviderError {
                provider: "Sarasina proxy",
                model: self.model.clone(),
                status: status.as_u16(),
                body: preview(&text),
            });
        }

        parse_proxy_text(&self.model, &text)
    }
}

fn parse_proxy_text(model: &str, raw: &str) -> Result<String, LlmError> {
    let malformed = || LlmError::MalformedResponse {
        model: model.to_string(),
        detail: preview(raw),
    };
    let parsed: ProxyResponse = serde_json::from_str(raw).map_err(|_| malformed())?;
    if let Some(answer) = parsed.response.filter(|r| !r.is_empty()) {
        return Ok(answer);
    }
    match parsed.detail {
        Some(Value::Null) | None => Err(malformed()),
        Some(Value::String(detail)) => Err(LlmError::ProxyError(detail)),
        Some(other) => Err(LlmError::ProxyError(other.to_string())),
    }
}

impl ModelBackend for SarasinaProxy {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::ProxySync
    }

    fn send(&self, prompt: String) -> SnapshotStream {
        let this = self.clone();
        Box::pin(stream::once(async move { this.generate(&prompt).await }))
    }
}

// ---------------------------------------------------------------------
// OLLAMA (local, streaming NDJSON)
// ---------------------------------------------------------------------

#[derive(Clone)]
struct OllamaStream {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaStream {
    async fn open(&self, prompt: &str) -> Result<reqwest::Response, LlmError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": true,
            "options": {
                "temperature": TEMPERATURE,
                "num_ctx": context_window(&self.model),
            },
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::transport(&self.endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::ProviderError {
                provider: "Ollama server",
                model: self.model.clone(),
                status: status.as_u16(),
                body: preview(&detail),
            });
        }
        Ok(response)
    }
}

impl ModelBackend for OllamaStream {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::LocalStream
    }

    fn send(&self, prompt: String) -> SnapshotStream {
        let this = self.clone();
        let stream = try_stream! {
            let response = this.open(&prompt).await?;
            let mut body = response.bytes_stream();
            let mut decoder = NdjsonDecoder::default();
            let mut answer = String::new();
            let mut emitted = false;

            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| LlmError::transport(&this.endpoint, e))?;
                for piece in decoder.push(&chunk) {
                    answer.push_str(&piece);
                    emitted = true;
                    yield answer.clone();
                }
            }
            for piece in decoder.finish() {
                answer.push_str(&piece);
                emitted = true;
                yield answer.clone();
            }
            if !emitted {
                yield answer;
            }
        };
        Box::pin(stream)
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: Option<String>,
}

/// Decodificador incremental de JSON delimitado por saltos de línea.
/// Las líneas incompletas esperan al siguiente trozo; las líneas que no son
/// JSON válido se descartan en silencio.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    /// Añade bytes recibidos y devuelve los fragmentos de texto de las líneas completas.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut pieces = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            pieces.extend(parse_line(&line));
        }
        pieces
    }

    /// Procesa lo que quede en el buffer al terminar el stream.
    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest).into_iter().collect()
    }
}

fn parse_line(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<OllamaChunk>(line) {
        Ok(chunk) => chunk.response.filter(|r| !r.is_empty()),
        Err(e) => {
            debug!("Fragmento de stream ignorado ({}): {}", e, line);
            None
        }
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
    if text.chars().count() > ERROR_BODY_PREVIEW {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_model_name() {
        assert_eq!(classify("gemini-flash"), ProviderFamily::CloudFallbackChain);
        assert_eq!(classify("Gemini-Pro"), ProviderFamily::CloudFallbackChain);
        assert_eq!(classify("sbintuitions/Sarasina2.2-3B"), ProviderFamily::ProxySync);
        assert_eq!(classify("llama3"), ProviderFamily::LocalStream);
        // "gemma" no empieza por "gemini": va a Ollama.
        assert_eq!(classify("gemma3:12b"), ProviderFamily::LocalStream);
        assert_eq!(classify("my-gemini"), ProviderFamily::LocalStream);
    }

    #[test]
    fn candidate_tier_by_flash_marker() {
        assert_eq!(gemini_candidates("gemini-flash"), FLASH_CANDIDATES);
        assert_eq!(gemini_candidates("gemini-2.5-FLASH"), FLASH_CANDIDATES);
        assert_eq!(gemini_candidates("gemini-pro"), PRO_CANDIDATES);
        assert_eq!(FLASH_CANDIDATES[0], "gemini-2.5-flash");
        assert_eq!(PRO_CANDIDATES[0], "gemini-2.5-pro");
    }

    #[test]
    fn context_window_by_size_marker() {
        assert_eq!(context_window("gpt-oss:20b"), 8192);
        assert_eq!(context_window("gemma3:12b"), 8192);
        assert_eq!(context_window("gpt-oss:120b"), 8192);
        assert_eq!(context_window("llama3"), 4096);
        assert_eq!(context_window("qwen:7b"), 4096);
    }

    #[test]
    fn missing_api_key_fails_before_network() {
        let manager = LlmManager::new(LlmEndpoints::default()).unwrap();
        let err = manager.backend_for("gemini-flash", None).err().unwrap();
        assert!(matches!(err, LlmError::MissingCredential { .. }));
        let err = manager.backend_for("gemini-pro", Some("   ")).err().unwrap();
        assert!(matches!(err, LlmError::MissingCredential { .. }));
        assert!(manager.backend_for("llama3", None).is_ok());
    }

    #[test]
    fn backend_family_matches_classification() {
        let manager = LlmManager::new(LlmEndpoints::default()).unwrap();
        let backend = manager.backend_for("gemini-pro", Some("k")).unwrap();
        assert_eq!(backend.family(), ProviderFamily::CloudFallbackChain);
        let backend = manager.backend_for("sarasina-2", None).unwrap();
        assert_eq!(backend.family(), ProviderFamily::ProxySync);
    }

    #[test]
    fn ndjson_decoder_handles_split_and_bad_lines() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(br#"{"response":"Hol"#).is_empty());
        assert_eq!(decoder.push(b"a\"}\n{\"response\":\" mundo\"}\n"), vec!["Hola", " mundo"]);
        assert!(decoder.push(b"no es json\n{\"done\":true}\n").is_empty());
        assert!(decoder.push(br#"{"response":"!"}"#).is_empty());
        assert_eq!(decoder.finish(), vec!["!"]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn gemini_body_parsing() {
        let ok = r#"{"candidates":[{"content":{"parts":[{"text":"Hola "},{"text":"mundo"}]}}]}"#;
        assert_eq!(parse_gemini_text("m", ok).unwrap(), "Hola mundo");

        let blocked = r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        assert!(matches!(
            parse_gemini_text("m", blocked),
            Err(LlmError::MalformedResponse { .. })
        ));
        assert!(matches!(
            parse_gemini_text("m", "<html>"),
            Err(LlmError::MalformedResponse { .. })
        ));
        for without_parts in [
            r#"{"candidates":[{"content":{"role":"model"}}]}"#,
            r#"{"candidates":[{"content":{}}]}"#,
            r#"{"candidates":[{"finishReason":"SAFETY"}]}"#,
        ] {
            assert!(matches!(
                parse_gemini_text("m", without_parts),
                Err(LlmError::MalformedResponse { .. })
            ));
        }
    }

    #[test]
    fn proxy_body_parsing() {
        assert_eq!(parse_proxy_text("s", r#"{"response":"ok"}"#).unwrap(), "ok");
        match parse_proxy_text("s", r#"{"detail":"model not loaded"}"#) {
            Err(LlmError::ProxyError(detail)) => assert_eq!(detail, "model not loaded"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            parse_proxy_text("s", r#"{"other":1}"#),
            Err(LlmError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn preview_truncates_long_bodies() {
        assert_eq!(preview("corto"), "corto");
        let long = "x".repeat(150);
        assert_eq!(preview(&long).len(), ERROR_BODY_PREVIEW + 3);
    }
}
