use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Json, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    config::Provider,
    error::ApiError,
    ingest::DocumentInput,
    models::{ChatMessage, ConversationRecord, SourceType},
    session::ConversationMemory,
    store::{self, Listing},
};

// --- Payloads y Respuestas de la API ---

#[derive(Serialize)]
pub struct ProviderInfo {
    id: Provider,
    label: &'static str,
    models: &'static [&'static str],
    configured: bool,
}

#[derive(Serialize)]
pub struct SessionCreated {
    session_id: Uuid,
}

#[derive(Serialize)]
pub struct LoadResponse {
    source_type: SourceType,
    provider: Provider,
    model: String,
    document_chars: usize,
}

#[derive(Deserialize)]
pub struct ChatPayload {
    input: String,
}

#[derive(Serialize)]
pub struct SessionView {
    loaded: bool,
    source_type: Option<SourceType>,
    provider: Option<Provider>,
    model: Option<String>,
    created_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
pub struct SavePayload {
    name: String,
}

#[derive(Serialize)]
pub struct SaveResponse {
    file: String,
}

#[derive(Serialize)]
pub struct DeleteResponse {
    deleted: bool,
}

// --- Router ---

/// Aplicación completa: API, frontend estático y CORS.
pub fn app(app_state: AppState) -> Router {
    let frontend = ServeDir::new(&app_state.config.frontend_dir);
    create_router(app_state)
        .fallback_service(frontend)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

pub fn create_router(app_state: AppState) -> Router {
    let upload_limit = app_state.config.max_upload_bytes;
    Router::new()
        .route("/api/providers", get(providers_handler))
        .route("/api/sessions", post(create_session_handler))
        .route(
            "/api/sessions/:id/load",
            post(load_handler).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/sessions/:id/chat", post(chat_handler))
        .route(
            "/api/sessions/:id/messages",
            get(session_handler).delete(clear_messages_handler),
        )
        .route("/api/sessions/:id/save", post(save_handler))
        .route(
            "/api/sessions/:id/conversations/:file",
            post(load_conversation_handler),
        )
        .route("/api/conversations", get(list_conversations_handler))
        .route("/api/conversations/:file", delete(delete_conversation_handler))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn providers_handler(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    let providers = Provider::ALL
        .into_iter()
        .map(|provider| ProviderInfo {
            id: provider,
            label: provider.label(),
            models: provider.models(),
            configured: !state.config.api_key_for(provider).is_empty(),
        })
        .collect();
    Json(providers)
}

#[axum::debug_handler]
async fn create_session_handler(State(state): State<AppState>) -> impl IntoResponse {
    let session_id = state.sessions.create().await;
    info!("Nueva sesión {}", session_id);
    (StatusCode::CREATED, Json(SessionCreated { session_id }))
}

/// "Cargar el Oráculo": ingiere el documento, fija proveedor/modelo y
/// reinicia la memoria de la sesión.
#[axum::debug_handler]
async fn load_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<LoadResponse>, ApiError> {
    if !state.sessions.exists(id).await {
        return Err(session_not_found(id));
    }

    let mut source_type = None;
    let mut provider = None;
    let mut model = None;
    let mut locator = None;
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Formulario no válido: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Error leyendo el fichero: {e}")))?;
                upload = Some(DocumentInput::Upload { file_name, data: data.to_vec() });
            }
            _ => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Campo '{name}' no válido: {e}")))?;
                match name.as_str() {
                    "source_type" => source_type = Some(value),
                    "provider" => provider = Some(value),
                    "model" => model = Some(value),
                    "locator" => locator = Some(value),
                    other => warn!("Ignorando campo de formulario desconocido '{}'", other),
                }
            }
        }
    }

    let source_type: SourceType = source_type
        .ok_or_else(|| ApiError::BadRequest("Falta el tipo de documento".to_string()))?
        .parse()
        .map_err(|e: anyhow::Error| ApiError::BadRequest(e.to_string()))?;
    let provider: Provider = provider
        .ok_or_else(|| ApiError::BadRequest("Falta el proveedor".to_string()))?
        .parse()
        .map_err(|e: anyhow::Error| ApiError::BadRequest(e.to_string()))?;
    let model = match model {
        Some(m) if provider.models().contains(&m.as_str()) => m,
        Some(m) => {
            return Err(ApiError::BadRequest(format!(
                "Modelo '{m}' no disponible para {provider}"
            )))
        }
        None => provider.models()[0].to_string(),
    };

    let input = if source_type.is_upload() {
        upload.ok_or_else(|| ApiError::BadRequest(format!("Sube un fichero {source_type}")))?
    } else {
        match locator.map(|l| l.trim().to_string()) {
            Some(l) if !l.is_empty() => DocumentInput::Locator(l),
            _ => return Err(ApiError::BadRequest("Indica la URL del documento".to_string())),
        }
    };

    let model_config = state.llm_manager.model_config(provider, &model)?;
    let document = state.loader.load(source_type, input).await?;
    let document_chars = document.chars().count();
    let chain = state.llm_manager.build_chain(model_config, source_type, &document);

    state
        .sessions
        .with_session(id, |session| session.install_chain(chain))
        .await
        .ok_or_else(|| session_not_found(id))?;

    Ok(Json(LoadResponse {
        source_type,
        provider,
        model,
        document_chars,
    }))
}

/// Responde en streaming (`text/plain`). El turno se añade a la memoria sólo
/// cuando la respuesta termina sin errores.
#[axum::debug_handler]
async fn chat_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ChatPayload>,
) -> Result<Response, ApiError> {
    let input = payload.input.trim().to_string();
    if input.is_empty() {
        return Err(ApiError::BadRequest("El mensaje está vacío".to_string()));
    }

    let (chain, history) = state
        .sessions
        .with_session(id, |s| (s.chain.clone(), s.memory.messages().to_vec()))
        .await
        .ok_or_else(|| session_not_found(id))?;
    let chain = chain.ok_or_else(|| ApiError::BadRequest("¡Carga el Oráculo!".to_string()))?;

    let mut upstream = chain.stream(&history, &input);

    // Los errores previos al primer fragmento se devuelven con su código HTTP.
    let first = match upstream.next().await {
        Some(Err(err)) => return Err(err.into()),
        other => other,
    };
    let mut upstream = stream::iter(first).chain(upstream);

    let (tx, rx) = mpsc::channel::<String>(32);
    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let mut answer = String::new();
        while let Some(item) = upstream.next().await {
            match item {
                Ok(delta) => {
                    answer.push_str(&delta);
                    // Si el cliente se desconecta se sigue consumiendo la respuesta.
                    let _ = tx.send(delta).await;
                }
                Err(err) => {
                    error!("Respuesta interrumpida en la sesión {}: {}", id, err);
                    let _ = tx.send(format!("\n\n[Error: {err}]")).await;
                    return;
                }
            }
        }

        let stored = sessions
            .with_session(id, |session| {
                let same_chain = session
                    .chain
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &chain));
                if same_chain {
                    session.memory.add_user_message(input);
                    session.memory.add_ai_message(answer);
                    debug!("Sesión {}: {} mensajes en memoria", id, session.memory.len());
                }
                same_chain
            })
            .await;
        if stored != Some(true) {
            warn!("La sesión {} cambió durante la respuesta; el turno no se guarda", id);
        }
    });

    let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    }));
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

#[axum::debug_handler]
async fn session_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    state
        .sessions
        .with_session(id, |s| {
            let chain = s.chain.as_ref();
            SessionView {
                loaded: chain.is_some(),
                source_type: chain.map(|c| c.source_type()),
                provider: chain.map(|c| c.model().provider),
                model: chain.map(|c| c.model().model.clone()),
                created_at: s.created_at,
                messages: s.memory.messages().to_vec(),
            }
        })
        .await
        .map(Json)
        .ok_or_else(|| session_not_found(id))
}

#[axum::debug_handler]
async fn clear_messages_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .sessions
        .with_session(id, |s| s.clear_memory())
        .await
        .ok_or_else(|| session_not_found(id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn save_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SavePayload>,
) -> Result<(StatusCode, Json<SaveResponse>), ApiError> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Escribe un nombre para la conversación".to_string()));
    }

    let record = state
        .sessions
        .with_session(id, |s| {
            s.chain.as_ref().map(|chain| ConversationRecord {
                name: name.clone(),
                timestamp: store::timestamp_now(),
                source_type: Some(chain.source_type()),
                provider: chain.model().provider.label().to_string(),
                model: chain.model().model.clone(),
                messages: s.memory.messages().to_vec(),
            })
        })
        .await
        .ok_or_else(|| session_not_found(id))?
        .ok_or_else(|| ApiError::BadRequest("No hay ninguna conversación cargada".to_string()))?;

    let path = state.store.save(&record)?;
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok((StatusCode::CREATED, Json(SaveResponse { file })))
}

/// Sustituye la memoria de la sesión por la de una conversación guardada.
#[axum::debug_handler]
async fn load_conversation_handler(
    State(state): State<AppState>,
    Path((id, file)): Path<(Uuid, String)>,
) -> Result<Json<ConversationRecord>, ApiError> {
    let path = state.store.resolve(&file)?;
    if !path.is_file() {
        return Err(ApiError::NotFound(format!("No existe la conversación {file}")));
    }
    let record = state.store.load(&path)?;

    let messages = record.messages.clone();
    state
        .sessions
        .with_session(id, move |s| s.memory = ConversationMemory::from_messages(messages))
        .await
        .ok_or_else(|| session_not_found(id))?;

    info!("Conversación '{}' cargada en la sesión {}", record.name, id);
    Ok(Json(record))
}

#[axum::debug_handler]
async fn list_conversations_handler(
    State(state): State<AppState>,
) -> Result<Json<Listing>, ApiError> {
    Ok(Json(state.store.list()?))
}

#[axum::debug_handler]
async fn delete_conversation_handler(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let path = state.store.resolve(&file)?;
    let deleted = state.store.delete(&path)?;
    Ok(Json(DeleteResponse { deleted }))
}

fn session_not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("Sesión {id} no encontrada"))
}
