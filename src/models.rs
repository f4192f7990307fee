//! Modelos de dominio (tipos de documento, mensajes de chat y conversaciones guardadas).

use std::{fmt, str::FromStr};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::config::Provider;

/// Origen del documento; decide el método de ingesta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Site,
    Youtube,
    Pdf,
    Csv,
    Txt,
}

impl SourceType {
    /// Etiqueta que se interpola en el prompt de sistema.
    pub fn label(self) -> &'static str {
        match self {
            Self::Site => "Site",
            Self::Youtube => "Youtube",
            Self::Pdf => "PDF",
            Self::Csv => "CSV",
            Self::Txt => "TXT",
        }
    }

    /// `true` si el documento llega como fichero subido y no como localizador.
    pub fn is_upload(self) -> bool {
        matches!(self, Self::Pdf | Self::Csv | Self::Txt)
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "site" => Ok(Self::Site),
            "youtube" => Ok(Self::Youtube),
            "pdf" => Ok(Self::Pdf),
            "csv" => Ok(Self::Csv),
            "txt" => Ok(Self::Txt),
            other => Err(anyhow!("Tipo de documento no soportado: {other}")),
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "human" => Some(Self::Human),
            "ai" => Some(Self::Ai),
            _ => None,
        }
    }
}

/// Un turno de la conversación.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn human(content: impl Into<String>) -> Self {
        Self { role: Role::Human, content: content.into() }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self { role: Role::Ai, content: content.into() }
    }
}

/// Conversación persistida: un fichero JSON por registro. El tipo de
/// documento puede faltar en ficheros antiguos o editados a mano.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub name: String,
    pub timestamp: String,
    pub source_type: Option<SourceType>,
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// Resumen de una conversación guardada, tal como aparece en el listado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub file: String,
    pub name: String,
    pub timestamp: String,
    pub source_type: Option<SourceType>,
    pub provider: String,
    pub model: String,
}

/// Selección de backend para una sesión. No se persiste.
#[derive(Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub provider: Provider,
    pub model: String,
    pub api_key: String,
}

// La credencial nunca debe acabar en los logs.
impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &"***")
            .finish()
    }
}
