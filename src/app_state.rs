use anyhow::{Context, Result};

use crate::{
    config::AppConfig, ingest::DocumentLoader, llm::LlmManager, session::SessionRegistry,
    store::ConversationStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub llm_manager: LlmManager,
    pub loader: DocumentLoader,
    pub store: ConversationStore,
    pub sessions: SessionRegistry,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self> {
        let llm_manager = LlmManager::from_config(&config);
        let loader = DocumentLoader::from_config(&config, llm_manager.clone());
        let store = ConversationStore::open(&config.history_dir).with_context(|| {
            format!("No se pudo abrir el historial en {}", config.history_dir.display())
        })?;

        Ok(Self {
            config,
            llm_manager,
            loader,
            store,
            sessions: SessionRegistry::default(),
        })
    }
}
