//! Almacenamiento clave-valor en un único fichero JSON y repositorio de documentos
//! persistentes que vive encima de él.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::models::Document;

/// Clave bajo la que se guarda la lista de documentos persistentes.
pub const DOCUMENTS_KEY: &str = "plowerRAGDocs";
/// Clave bajo la que se guarda la API key de Gemini.
pub const API_KEY_KEY: &str = "plowerGeminiApiKey";

/// Blob clave-valor compartido. Clonar el handle comparte el mismo contenido.
#[derive(Clone, Debug)]
pub struct KvStore {
    inner: Arc<Mutex<KvInner>>,
}

#[derive(Debug)]
struct KvInner {
    path: Option<PathBuf>,
    entries: Map<String, Value>,
}

impl KvStore {
    /// Abre el fichero indicado. Si no existe se empieza vacío; si está corrupto
    /// se avisa y también se empieza vacío.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("No se pudo leer {}", path.display()))?;
            match serde_json::from_str::<Map<String, Value>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Almacén {} corrupto, se ignora su contenido: {}", path.display(), e);
                    Map::new()
                }
            }
        } else {
            Map::new()
        };
        info!("Almacén clave-valor abierto en {}", path.display());
        Ok(Self {
            inner: Arc::new(Mutex::new(KvInner {
                path: Some(path),
                entries,
            })),
        })
    }

    /// Almacén sin fichero asociado (tests y modo efímero).
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(KvInner {
                path: None,
                entries: Map::new(),
            })),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let inner = self.lock();
        let value = inner.entries.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Valor con formato inesperado en la clave '{}': {}", key, e);
                None
            }
        }
    }

    /// Si la escritura en disco falla, el valor anterior se restaura.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut inner = self.lock();
        let previous = inner.entries.insert(key.to_string(), value);
        flush(&inner).inspect_err(|_| restore(&mut inner, key, previous))
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock();
        let Some(previous) = inner.entries.remove(key) else {
            return Ok(false);
        };
        flush(&inner).inspect_err(|_| restore(&mut inner, key, Some(previous)))?;
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KvInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn restore(inner: &mut KvInner, key: &str, previous: Option<Value>) {
    match previous {
        Some(value) => inner.entries.insert(key.to_string(), value),
        None => inner.entries.remove(key),
    };
}

/// Escritura atómica: fichero temporal + rename.
fn flush(inner: &KvInner) -> Result<()> {
    let Some(path) = inner.path.as_deref() else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("No se pudo crear el directorio {}", parent.display()))?;
    }
    let tmp = tmp_path(path);
    let raw = serde_json::to_string(&inner.entries)?;
    fs::write(&tmp, raw).with_context(|| format!("No se pudo escribir {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("No se pudo reemplazar {}", path.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Resultado de fusionar documentos escaneados con la lista persistente.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MergeSummary {
    pub added: usize,
    pub updated: usize,
}

impl MergeSummary {
    pub fn changed(&self) -> bool {
        self.added > 0 || self.updated > 0
    }
}

/// Lista de documentos persistentes. Los índices sólo son válidos hasta la
/// siguiente mutación: quien los use debe volver a resolverlos con `list()`.
#[derive(Debug)]
pub struct DocumentRepository {
    docs: Vec<Document>,
    store: KvStore,
}

impl DocumentRepository {
    /// Carga los documentos guardados en el almacén.
    pub fn load(store: KvStore) -> Self {
        let docs: Vec<Document> = store.get(DOCUMENTS_KEY).unwrap_or_default();
        info!("{} documentos persistentes cargados.", docs.len());
        Self { docs, store }
    }

    pub fn list(&self) -> &[Document] {
        &self.docs
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Document> {
        self.docs.get(index)
    }

    /// Los `n` documentos más recientes, del más nuevo al más antiguo.
    pub fn recent(&self, n: usize) -> Vec<&Document> {
        self.docs.iter().rev().take(n).collect()
    }

    pub fn add(&mut self, doc: Document) -> Result<()> {
        let mut next = self.docs.clone();
        next.push(doc);
        self.commit(next)
    }

    pub fn add_many(&mut self, docs: impl IntoIterator<Item = Document>) -> Result<usize> {
        let mut next = self.docs.clone();
        next.extend(docs);
        let added = next.len() - self.docs.len();
        if added > 0 {
            self.commit(next)?;
        }
        Ok(added)
    }

    /// Actualiza el contenido del primer documento con ese nombre o lo añade al final.
    pub fn upsert_by_name(&mut self, doc: Document) -> Result<MergeSummary> {
        self.merge(std::iter::once(doc))
    }

    /// Fusiona documentos escaneados: sólo se actualizan los que cambian de contenido.
    pub fn merge(&mut self, scanned: impl IntoIterator<Item = Document>) -> Result<MergeSummary> {
        let mut summary = MergeSummary::default();
        let mut next = self.docs.clone();
        for doc in scanned {
            match next.iter_mut().find(|d| d.name == doc.name) {
                Some(existing) => {
                    if existing.content != doc.content {
                        existing.content = doc.content;
                        summary.updated += 1;
                    }
                }
                None => {
                    next.push(doc);
                    summary.added += 1;
                }
            }
        }
        if summary.changed() {
            self.commit(next)?;
        }
        Ok(summary)
    }

    /// Renombra el documento. Devuelve `false` si el nombre nuevo está vacío
    /// o coincide con el actual.
    pub fn rename(&mut self, index: usize, new_name: &str) -> Result<bool> {
        let new_name = new_name.trim();
        let current = self
            .docs
            .get(index)
            .ok_or_else(|| anyhow!("No existe el documento con índice {index}"))?;
        if new_name.is_empty() || new_name == current.name {
            return Ok(false);
        }
        let mut next = self.docs.clone();
        next[index].name = new_name.to_string();
        self.commit(next)?;
        Ok(true)
    }

    pub fn delete(&mut self, index: usize) -> Result<Document> {
        if index >= self.docs.len() {
            return Err(anyhow!("No existe el documento con índice {index}"));
        }
        let mut next = self.docs.clone();
        let removed = next.remove(index);
        self.commit(next)?;
        Ok(removed)
    }

    /// Borra todos los documentos y la clave del almacén.
    pub fn clear(&mut self) -> Result<()> {
        self.docs.clear();
        self.store.remove(DOCUMENTS_KEY)?;
        Ok(())
    }

    /// Guarda `next` y sólo entonces lo adopta como lista en memoria.
    fn commit(&mut self, next: Vec<Document>) -> Result<()> {
        self.store.set(DOCUMENTS_KEY, &next).map_err(|e| {
            error!("No se pudieron guardar los documentos: {:#}", e);
            e
        })?;
        self.docs = next;
        Ok(())
    }
}

/// API key de Gemini guardada en el almacén.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    store: KvStore,
}

impl CredentialStore {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub fn get(&self) -> Option<String> {
        self.store
            .get::<String>(API_KEY_KEY)
            .filter(|key| !key.trim().is_empty())
    }

    pub fn save(&self, key: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("La API key está vacía"));
        }
        self.store.set(API_KEY_KEY, &key)
    }

    /// Elimina la key guardada. Devuelve si había alguna.
    pub fn evict(&self) -> Result<bool> {
        let existed = self.store.remove(API_KEY_KEY)?;
        if existed {
            warn!("API key guardada eliminada.");
        }
        Ok(existed)
    }
}
