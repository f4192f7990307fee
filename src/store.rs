//! Historial de conversaciones en disco: un fichero JSON por conversación,
//! con nombre `{timestamp}_{etiqueta}.json`.
//!
//! No hay bloqueos ni escritura atómica. Dos guardados con la misma etiqueta
//! dentro del mismo segundo comparten fichero y el segundo sobrescribe al primero.

use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    error::StoreError,
    models::{ChatMessage, ConversationRecord, ConversationSummary, Role, SourceType},
};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Marca temporal ordenable lexicográficamente, con resolución de segundos.
pub fn timestamp_now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Resultado de listar el historial. Los ficheros ilegibles no abortan el
/// listado: quedan en `skipped` con el motivo.
#[derive(Debug, Default, Serialize)]
pub struct Listing {
    pub conversations: Vec<ConversationSummary>,
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedEntry {
    pub file: String,
    pub reason: String,
}

// Formato en disco, tolerante con campos ausentes. Acepta también las claves
// en portugués de los ficheros escritos por versiones anteriores.
#[derive(Deserialize)]
struct StoredRecord {
    #[serde(default = "default_name", alias = "nome")]
    name: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default, alias = "tipo_arquivo")]
    source_type: Option<String>,
    #[serde(default, alias = "provedor")]
    provider: String,
    #[serde(default, alias = "modelo")]
    model: String,
    #[serde(default, alias = "mensagens")]
    messages: Vec<StoredMessage>,
}

#[derive(Deserialize)]
struct StoredMessage {
    #[serde(alias = "type")]
    role: String,
    content: String,
}

fn default_name() -> String {
    "Sin nombre".to_string()
}

/// `"pdf"` o etiquetas antiguas como `"📄 PDF"`. `None` si no se reconoce.
fn parse_source_type(raw: Option<&str>) -> Option<SourceType> {
    raw?.split_whitespace().last()?.parse().ok()
}

#[derive(Debug, Clone)]
pub struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    /// Abre (y crea si hace falta) el directorio del historial.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("Historial de conversaciones en {}", dir.display());
        Ok(Self { dir })
    }

    /// Escribe la conversación y devuelve la ruta del fichero.
    pub fn save(&self, record: &ConversationRecord) -> Result<PathBuf, StoreError> {
        let label = sanitize_label(&record.name)?;
        let path = self.dir.join(format!("{}_{}.json", record.timestamp, label));

        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json)?;

        info!(
            "Conversación '{}' guardada en {} ({} mensajes)",
            record.name,
            path.display(),
            record.messages.len()
        );
        Ok(path)
    }

    /// Lista las conversaciones guardadas, de la más reciente a la más antigua.
    pub fn list(&self) -> Result<Listing, StoreError> {
        let mut listing = Listing::default();
        if !self.dir.is_dir() {
            return Ok(listing);
        }

        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Entrada ilegible en el historial: {}", err);
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }

            let file = entry.file_name().to_string_lossy().to_string();
            // Se lee el registro completo: todo lo listado se puede cargar.
            match read_record(path) {
                Ok(stored) => listing.conversations.push(ConversationSummary {
                    file,
                    source_type: parse_source_type(stored.source_type.as_deref()),
                    name: stored.name,
                    timestamp: stored.timestamp,
                    provider: stored.provider,
                    model: stored.model,
                }),
                Err(err) => {
                    warn!("Omitiendo conversación corrupta {}: {}", path.display(), err);
                    listing.skipped.push(SkippedEntry { file, reason: err.to_string() });
                }
            }
        }

        listing.conversations.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.file.cmp(&a.file))
        });
        Ok(listing)
    }

    /// Lee una conversación y reconstruye sus turnos. Los mensajes con un rol
    /// desconocido se descartan.
    pub fn load(&self, path: &Path) -> Result<ConversationRecord, StoreError> {
        let stored = read_record(path)?;

        let messages = stored
            .messages
            .into_iter()
            .filter_map(|msg| match Role::parse(&msg.role) {
                Some(role) => Some(ChatMessage { role, content: msg.content }),
                None => {
                    debug!("Descartando mensaje con rol desconocido '{}'", msg.role);
                    None
                }
            })
            .collect();

        Ok(ConversationRecord {
            name: stored.name,
            timestamp: stored.timestamp,
            source_type: parse_source_type(stored.source_type.as_deref()),
            provider: stored.provider,
            model: stored.model,
            messages,
        })
    }

    /// Borra el fichero si existe. Devuelve `false` si no había nada que borrar.
    pub fn delete(&self, path: &Path) -> Result<bool, StoreError> {
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        info!("Conversación borrada: {}", path.display());
        Ok(true)
    }

    /// Traduce un nombre de fichero del listado a una ruta dentro del historial.
    /// Sólo se aceptan nombres de un único componente terminados en `.json`.
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf, StoreError> {
        let mut components = Path::new(file_name).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        let path = self.dir.join(file_name);
        let valid = single
            && !file_name.contains(['/', '\\'])
            && file_name.ends_with(".json")
            && path.parent() == Some(self.dir.as_path());
        if !valid {
            return Err(StoreError::InvalidName(file_name.to_string()));
        }
        Ok(path)
    }
}

fn read_record(path: &Path) -> Result<StoredRecord, StoreError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn sanitize_label(name: &str) -> Result<String, StoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(trimmed.replace(['/', '\\'], "_"))
}
