//! Abstracción sobre los proveedores de LLM.
//!
//! El chat se sirve en streaming con un agente de Rig por turno, contra el
//! endpoint `/chat/completions` de OpenAI o de Groq. La transcripción de audio
//! (Whisper) también pasa por Rig.

use std::{path::Path, pin::Pin, sync::Arc};

use futures::{Stream, StreamExt};
use rig::{
    agent::{AgentBuilder, MultiTurnStreamItem},
    completion::CompletionModel,
    streaming::{StreamedAssistantContent, StreamingChat},
};
use tracing::{debug, info};

use crate::{
    config::{AppConfig, Provider},
    error::{LlmError, LoaderError},
    models::{ChatMessage, ModelConfig, SourceType},
    prompt::{self, ChatTurn},
};

/// Fragmentos de texto de una respuesta en curso.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Backend de chat capaz de responder en streaming.
pub trait ChatBackend: Send + Sync {
    fn stream_chat(&self, turn: ChatTurn) -> ChatStream;
}

/// Backend sobre un modelo de completado de Rig.
pub struct RigChat<M> {
    model: M,
}

impl<M> RigChat<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

impl<M> ChatBackend for RigChat<M>
where
    M: CompletionModel + 'static,
{
    fn stream_chat(&self, turn: ChatTurn) -> ChatStream {
        let agent = AgentBuilder::new(self.model.clone())
            .preamble(&turn.preamble)
            .build();
        let history = turn.rig_history();
        let input = turn.input;

        Box::pin(async_stream::stream! {
            let mut response = agent.stream_chat(input, history).await;
            while let Some(item) = response.next().await {
                match item {
                    Ok(MultiTurnStreamItem::StreamItem(StreamedAssistantContent::Text(text))) => {
                        if !text.text.is_empty() {
                            yield Ok(text.text);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(LlmError::Stream(e.to_string()));
                        break;
                    }
                }
            }
        })
    }
}

/// Cadena configurada en cada "carga": prompt de sistema fijo + backend.
pub struct ChatChain {
    system_message: String,
    source_type: SourceType,
    model: ModelConfig,
    backend: Arc<dyn ChatBackend>,
}

impl ChatChain {
    pub fn new(
        system_message: String,
        source_type: SourceType,
        model: ModelConfig,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        Self { system_message, source_type, model, backend }
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    /// Envía sistema + historial + entrada y devuelve la respuesta en streaming.
    pub fn stream(&self, history: &[ChatMessage], input: &str) -> ChatStream {
        let turn = prompt::assemble(&self.system_message, history, input);
        debug!(
            "Enviando {} mensajes de historial a {} / {}",
            turn.history.len(),
            self.model.provider,
            self.model.model
        );
        self.backend.stream_chat(turn)
    }
}

/// Gestor de LLMs: credenciales y URLs base de cada proveedor.
#[derive(Clone)]
pub struct LlmManager {
    openai_api_key: String,
    groq_api_key: String,
    openai_base_url: String,
    groq_base_url: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            openai_api_key: cfg.api_key_for(Provider::OpenAI).to_string(),
            groq_api_key: cfg.api_key_for(Provider::Groq).to_string(),
            openai_base_url: cfg.base_url_for(Provider::OpenAI).to_string(),
            groq_base_url: cfg.base_url_for(Provider::Groq).to_string(),
        }
    }

    /// Selecciona proveedor y modelo con la credencial del entorno.
    pub fn model_config(&self, provider: Provider, model: &str) -> Result<ModelConfig, LlmError> {
        let api_key = match provider {
            Provider::OpenAI => &self.openai_api_key,
            Provider::Groq => &self.groq_api_key,
        };
        if api_key.is_empty() {
            return Err(LlmError::MissingCredential(provider));
        }
        Ok(ModelConfig {
            provider,
            model: model.to_string(),
            api_key: api_key.clone(),
        })
    }

    /// Interpola el documento en el prompt e instancia el cliente del proveedor.
    pub fn build_chain(
        &self,
        model: ModelConfig,
        source_type: SourceType,
        document: &str,
    ) -> ChatChain {
        use rig::client::CompletionClient as _;
        use rig::providers::{groq, openai};

        let backend: Arc<dyn ChatBackend> = match model.provider {
            Provider::OpenAI => {
                let client = openai::Client::builder(&model.api_key)
                    .base_url(&self.openai_base_url)
                    .build();
                // API de chat clásica, la misma que expone Groq.
                Arc::new(RigChat::new(
                    client.completion_model(&model.model).completions_api(),
                ))
            }
            Provider::Groq => {
                let client = groq::Client::builder(&model.api_key)
                    .base_url(&self.groq_base_url)
                    .build();
                Arc::new(RigChat::new(client.completion_model(&model.model)))
            }
        };

        let system_message = prompt::system_message(source_type, document);
        debug!("Prompt de sistema:\n{}", system_message);
        info!(
            "Oráculo configurado: {} / {} sobre un documento {} ({} caracteres)",
            model.provider,
            model.model,
            source_type,
            document.chars().count()
        );

        ChatChain::new(system_message, source_type, model, backend)
    }

    // ---------------------------------------------------------------------
    // TRANSCRIPCIÓN
    // ---------------------------------------------------------------------

    /// Transcribe un fichero de audio con Whisper (siempre vía OpenAI).
    pub async fn transcribe(&self, audio: &Path) -> Result<String, LoaderError> {
        use rig::client::TranscriptionClient as _;
        use rig::providers::openai::{self, WHISPER_1};
        use rig::transcription::TranscriptionModel as _;

        if self.openai_api_key.is_empty() {
            return Err(LoaderError::Transcription(
                "falta OPENAI_API_KEY para usar Whisper".to_string(),
            ));
        }

        let client = openai::Client::new(&self.openai_api_key);
        let model = client.transcription_model(WHISPER_1);

        let response = model
            .transcription_request()
            .load_file(audio)
            .send()
            .await
            .map_err(|e| LoaderError::Transcription(e.to_string()))?;

        info!("Transcrito {} ({} caracteres)", audio.display(), response.text.len());
        Ok(response.text)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{body::Body, http::header, routing::post, Router};
    use futures::stream;
    use std::{io, sync::Mutex, time::Duration};

    /// Backend fijo para pruebas: devuelve los fragmentos dados y guarda lo recibido.
    pub(crate) struct ScriptedBackend {
        pub chunks: Vec<&'static str>,
        pub received: Mutex<Vec<ChatTurn>>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(chunks: Vec<&'static str>) -> Self {
            Self { chunks, received: Mutex::new(Vec::new()) }
        }
    }

    impl ChatBackend for ScriptedBackend {
        fn stream_chat(&self, turn: ChatTurn) -> ChatStream {
            self.received.lock().unwrap().push(turn);
            let items: Vec<Result<String, LlmError>> =
                self.chunks.iter().map(|c| Ok(c.to_string())).collect();
            Box::pin(stream::iter(items))
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    /// `/v1/chat/completions` que responde siempre con el mismo cuerpo SSE.
    async fn spawn_sse_server(body: &'static str) -> String {
        serve(Router::new().route(
            "/v1/chat/completions",
            post(move || async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }),
        ))
        .await
    }

    /// Emite `events` con `pause` entre ellos. Con `broken` la conexión se
    /// corta tras el último evento, sin `[DONE]`.
    pub(crate) async fn spawn_paced_sse_server(
        events: &'static [&'static str],
        pause: Duration,
        broken: bool,
    ) -> String {
        serve(Router::new().route(
            "/v1/chat/completions",
            post(move || async move {
                let body = Body::from_stream(async_stream::stream! {
                    for (i, event) in events.iter().enumerate() {
                        if i > 0 {
                            tokio::time::sleep(pause).await;
                        }
                        yield Ok::<&'static str, io::Error>(*event);
                    }
                    if broken {
                        tokio::time::sleep(pause).await;
                        yield Err(io::Error::new(io::ErrorKind::ConnectionReset, "corte"));
                    }
                });
                ([(header::CONTENT_TYPE, "text/event-stream")], body)
            }),
        ))
        .await
    }

    fn manager(openai_base_url: &str) -> LlmManager {
        LlmManager {
            openai_api_key: "sk-test".into(),
            groq_api_key: String::new(),
            openai_base_url: openai_base_url.into(),
            groq_base_url: "http://127.0.0.1:9/v1".into(),
        }
    }

    fn openai_chain(manager: &LlmManager) -> ChatChain {
        let model = manager.model_config(Provider::OpenAI, "gpt-4.1-nano").unwrap();
        manager.build_chain(model, SourceType::Txt, "El Oráculo sabe cosas.")
    }

    #[tokio::test]
    async fn streams_text_deltas_until_done() {
        let base = spawn_sse_server(concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hola\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\", mundo\"}}]}\n\n",
            "data: [DONE]\n\n",
        ))
        .await;

        let chain = openai_chain(&manager(&base));
        let chunks: Vec<String> = chain
            .stream(&[ChatMessage::human("hi"), ChatMessage::ai("hello")], "hola")
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, ["Hola", ", mundo"]);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let chain = openai_chain(&manager("http://127.0.0.1:9/v1"));
        let first = chain.stream(&[], "hola").next().await.unwrap();
        assert!(matches!(first, Err(LlmError::Stream(_))));
    }

    #[tokio::test]
    async fn dropped_connection_surfaces_after_partial_text() {
        let base = spawn_paced_sse_server(
            &["data: {\"choices\":[{\"delta\":{\"content\":\"Hola\"}}]}\n\n"],
            Duration::from_millis(100),
            true,
        )
        .await;

        let chain = openai_chain(&manager(&base));
        let mut response = chain.stream(&[], "hola");
        assert_eq!(response.next().await.unwrap().unwrap(), "Hola");
        assert!(matches!(response.next().await, Some(Err(LlmError::Stream(_)))));
    }

    #[test]
    fn chain_sends_preamble_history_and_input() {
        let backend = Arc::new(ScriptedBackend::new(vec!["ok"]));
        let model = ModelConfig {
            provider: Provider::Groq,
            model: "llama-3.1-8b-instant".into(),
            api_key: "gsk".into(),
        };
        let chain = ChatChain::new("SYS".into(), SourceType::Txt, model, backend.clone());

        let history = [ChatMessage::human("hi"), ChatMessage::ai("hello")];
        let _ = chain.stream(&history, "otra");
        let received = backend.received.lock().unwrap();
        assert_eq!(
            received[0],
            ChatTurn {
                preamble: "SYS".into(),
                history: history.to_vec(),
                input: "otra".into(),
            }
        );
    }

    #[test]
    fn missing_credential_is_rejected() {
        let manager = manager("http://localhost");
        assert!(matches!(
            manager.model_config(Provider::Groq, "llama3-8b-8192"),
            Err(LlmError::MissingCredential(Provider::Groq))
        ));
        assert!(manager.model_config(Provider::OpenAI, "gpt-4.1-nano").is_ok());
    }
}
