//! Errores tipados de los componentes y su traducción a respuestas HTTP.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::{config::Provider, models::SourceType};

#[derive(Debug, Error)]
pub enum LoaderError {
    /// Fallo fatal de carga: se agotaron los reintentos del sitio.
    #[error("No se pudo cargar el sitio {url} tras {attempts} intentos")]
    SiteExhausted { url: String, attempts: u32 },

    #[error("El documento {0} no contiene texto")]
    EmptyDocument(SourceType),

    #[error("Localizador no válido: {0}")]
    InvalidLocator(String),

    #[error("Error HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No se pudo extraer texto del PDF: {0}")]
    Pdf(String),

    #[error("Error leyendo el CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("El fichero de texto no es UTF-8 válido")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("Error descargando el audio del vídeo: {0}")]
    AudioDownload(String),

    #[error("Error transcribiendo el audio: {0}")]
    Transcription(String),

    #[error("Error de E/S: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Nombre de conversación no válido: {0}")]
    InvalidName(String),

    #[error("Error de E/S en el historial: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON de conversación no válido: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Falta la clave de API para {0}")]
    MissingCredential(Provider),

    /// Error del proveedor (HTTP, estado no válido o corte del stream).
    #[error("Error en el stream de respuesta: {0}")]
    Stream(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Loader(LoaderError::SiteExhausted { .. }) => StatusCode::BAD_GATEWAY,
            ApiError::Loader(LoaderError::Http(_))
            | ApiError::Loader(LoaderError::AudioDownload(_))
            | ApiError::Loader(LoaderError::Transcription(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Loader(LoaderError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Loader(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Store(StoreError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Llm(LlmError::MissingCredential(_)) => StatusCode::BAD_REQUEST,
            ApiError::Llm(_) => StatusCode::BAD_GATEWAY,
        };

        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!("{}", message);
        } else {
            tracing::warn!("{}", message);
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}
