//! Carga y gestión de configuración de la aplicación (servidor, almacenamiento y endpoints LLM).

use std::{env, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::locale::Locale;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_SARASINA_PROXY_URL: &str = "http://localhost:8001/api/sarasina";
pub const DEFAULT_OLLAMA_GENERATE_URL: &str = "http://localhost:11434/api/generate";

/// Endpoints de los tres tipos de backend de modelos.
#[derive(Clone, Debug)]
pub struct LlmEndpoints {
    pub gemini_base_url: String,
    pub sarasina_proxy_url: String,
    pub ollama_generate_url: String,
    pub request_timeout: Duration,
}

impl Default for LlmEndpoints {
    fn default() -> Self {
        Self {
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            sarasina_proxy_url: DEFAULT_SARASINA_PROXY_URL.to_string(),
            ollama_generate_url: DEFAULT_OLLAMA_GENERATE_URL.to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub data_file: PathBuf,
    pub frontend_dir: PathBuf,
    pub open_browser: bool,

    pub locale: Locale,
    pub default_model: String,
    pub endpoints: LlmEndpoints,
    pub sync_interval: Duration,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let data_file = match env::var("PLOWER_DATA_FILE") {
            Ok(path) => PathBuf::from(path),
            Err(_) => dirs::data_dir()
                .ok_or_else(|| anyhow!("No se pudo determinar el directorio de datos del usuario"))?
                .join("plower")
                .join("plower_store.json"),
        };

        let frontend_dir =
            PathBuf::from(env::var("FRONTEND_DIR").unwrap_or_else(|_| "frontend".to_string()));
        let open_browser = parse_bool(env::var("OPEN_BROWSER").ok().as_deref(), true);

        let locale = env::var("PLOWER_LOCALE")
            .or_else(|_| env::var("LC_ALL"))
            .or_else(|_| env::var("LANG"))
            .map(|tag| Locale::from_tag(&tag))
            .unwrap_or(Locale::En);

        let default_model =
            env::var("PLOWER_DEFAULT_MODEL").unwrap_or_else(|_| "llama3".to_string());

        let endpoints = LlmEndpoints {
            gemini_base_url: url_var("GEMINI_BASE_URL", DEFAULT_GEMINI_BASE_URL)?,
            sarasina_proxy_url: url_var("SARASINA_PROXY_URL", DEFAULT_SARASINA_PROXY_URL)?,
            ollama_generate_url: url_var("OLLAMA_GENERATE_URL", DEFAULT_OLLAMA_GENERATE_URL)?,
            request_timeout: Duration::from_secs(secs_var("LLM_REQUEST_TIMEOUT_SECS", 120)?),
        };

        let sync_interval = Duration::from_secs(secs_var("SYNC_INTERVAL_SECS", 10)?);

        Ok(Self {
            server_addr,
            data_file,
            frontend_dir,
            open_browser,
            locale,
            default_model,
            endpoints,
            sync_interval,
        })
    }
}

fn url_var(name: &str, default: &str) -> Result<String> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    Url::parse(&value).with_context(|| format!("{name} no es una URL válida: {value}"))?;
    Ok(value.trim_end_matches('/').to_string())
}

fn secs_var(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{name} debe ser un número de segundos: {raw}"))?;
            if secs == 0 {
                return Err(anyhow!("{name} debe ser mayor que cero"));
            }
            Ok(secs)
        }
        Err(_) => Ok(default),
    }
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|s| s.trim().to_lowercase()) {
        Some(v) if v == "0" || v == "false" || v == "no" => false,
        Some(v) if v == "1" || v == "true" || v == "yes" => true,
        _ => default,
    }
}
