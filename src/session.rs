//! Estado explícito de cada sesión de chat (cadena configurada + memoria),
//! propiedad del registro de sesiones y no de un global del proceso.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{llm::ChatChain, models::ChatMessage};

/// Historial de turnos de una sesión, en orden.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationMemory {
    messages: Vec<ChatMessage>,
}

impl ConversationMemory {
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::human(content));
    }

    pub fn add_ai_message(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::ai(content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

pub struct ChatSession {
    pub chain: Option<Arc<ChatChain>>,
    pub memory: ConversationMemory,
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    fn new() -> Self {
        Self {
            chain: None,
            memory: ConversationMemory::default(),
            created_at: Utc::now(),
        }
    }

    /// Nueva cadena tras una carga: la memoria empieza vacía.
    pub fn install_chain(&mut self, chain: ChatChain) {
        self.chain = Some(Arc::new(chain));
        self.memory = ConversationMemory::default();
    }

    pub fn clear_memory(&mut self) {
        self.memory = ConversationMemory::default();
    }
}

/// Sesiones activas indexadas por id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, ChatSession>>>,
}

impl SessionRegistry {
    pub async fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.write().await.insert(id, ChatSession::new());
        id
    }

    pub async fn exists(&self, id: Uuid) -> bool {
        self.inner.read().await.contains_key(&id)
    }

    /// Ejecuta `f` sobre la sesión con acceso exclusivo. `None` si no existe.
    pub async fn with_session<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut ChatSession) -> R,
    ) -> Option<R> {
        let mut sessions = self.inner.write().await;
        sessions.get_mut(&id).map(f)
    }
}
