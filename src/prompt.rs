//! Montaje del prompt: instrucción de sistema con el documento completo,
//! historial de la sesión y el nuevo turno del usuario.
//!
//! No hay truncado ni recuperación por fragmentos; el documento entero se
//! reenvía en cada turno.

use rig::message::Message;

use crate::models::{ChatMessage, Role, SourceType};

/// Lo que se envía al modelo en cada turno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub preamble: String,
    pub history: Vec<ChatMessage>,
    pub input: String,
}

impl ChatTurn {
    /// Historial como mensajes de Rig, en el mismo orden.
    pub fn rig_history(&self) -> Vec<Message> {
        self.history
            .iter()
            .map(|msg| match msg.role {
                Role::Human => Message::user(msg.content.clone()),
                Role::Ai => Message::assistant(msg.content.clone()),
            })
            .collect()
    }
}

/// Instrucción de sistema del Oráculo para un documento ya ingerido.
pub fn system_message(source_type: SourceType, document: &str) -> String {
    format!(
        r#"Eres un asistente amigable llamado Oráculo.
Tienes acceso a la siguiente información procedente
de un documento {}:

####
{}
####

Utiliza la información proporcionada para basar tus respuestas.

Siempre que haya $ en tu salida, sustitúyelo por S.

Si la información del documento es algo como "Just a moment...Enable JavaScript and cookies to continue"
sugiere al usuario que vuelva a cargar el Oráculo."#,
        source_type.label(),
        document
    )
}

/// Sistema + historial + entrada. El historial conserva su orden.
pub fn assemble(system: &str, history: &[ChatMessage], input: &str) -> ChatTurn {
    ChatTurn {
        preamble: system.to_string(),
        history: history.to_vec(),
        input: input.to_string(),
    }
}
