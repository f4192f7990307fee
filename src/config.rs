//! Carga y gestión de configuración de la aplicación (servidor, proveedores LLM e ingesta).

use std::{env, fmt, path::PathBuf, str::FromStr};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Proveedores de chat disponibles. Ambos hablan el protocolo de OpenAI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Groq,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::OpenAI, Provider::Groq];

    /// Modelos seleccionables para cada proveedor.
    pub fn models(self) -> &'static [&'static str] {
        match self {
            Self::OpenAI => &["gpt-4.1-nano", "gpt-4.1-mini"],
            Self::Groq => &[
                "llama3-8b-8192",
                "deepseek-r1-distill-llama-70b",
                "llama-3.1-8b-instant",
            ],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::OpenAI => "OpenAI",
            Self::Groq => "Groq",
        }
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "groq" => Ok(Self::Groq),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub open_browser: bool,
    pub frontend_dir: PathBuf,
    pub history_dir: PathBuf,
    pub max_upload_bytes: usize,

    pub openai_api_key: String,
    pub groq_api_key: String,
    pub openai_base_url: String,
    pub groq_base_url: String,

    pub youtube_audio_dir: PathBuf,
    pub ytdlp_bin: String,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());
        let open_browser = env::var("OPEN_BROWSER")
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(true);

        let max_upload_mb: usize = match env::var("MAX_UPLOAD_MB") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| anyhow!("MAX_UPLOAD_MB no es un número válido: {raw}"))?,
            Err(_) => 200,
        };

        Ok(Self {
            server_addr,
            open_browser,
            frontend_dir: env_path("FRONTEND_DIR", "frontend"),
            history_dir: env_path("HISTORY_DIR", "historico_chats"),
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            // Las credenciales vacías sólo fallan al cargar un modelo de ese proveedor.
            openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            groq_api_key: env::var("GROQ_API_KEY").unwrap_or_default(),
            openai_base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            groq_base_url: env::var("GROQ_BASE_URL")
                .unwrap_or_else(|_| "https://api.groq.com/openai/v1".to_string()),
            youtube_audio_dir: env_path("YOUTUBE_AUDIO_DIR", "docs/youtube"),
            ytdlp_bin: env::var("YTDLP_BIN").unwrap_or_else(|_| "yt-dlp".to_string()),
        })
    }

    /// Credencial por defecto del proveedor, tomada del entorno.
    pub fn api_key_for(&self, provider: Provider) -> &str {
        match provider {
            Provider::OpenAI => &self.openai_api_key,
            Provider::Groq => &self.groq_api_key,
        }
    }

    pub fn base_url_for(&self, provider: Provider) -> &str {
        match provider {
            Provider::OpenAI => &self.openai_base_url,
            Provider::Groq => &self.groq_base_url,
        }
    }
}

#[cfg(test)]
impl AppConfig {
    /// Configuración aislada bajo `root`, sin credenciales reales.
    pub(crate) fn for_tests(root: &std::path::Path) -> Self {
        Self {
            server_addr: "127.0.0.1:0".to_string(),
            open_browser: false,
            frontend_dir: root.join("frontend"),
            history_dir: root.join("historico_chats"),
            max_upload_bytes: 10 * 1024 * 1024,
            openai_api_key: "sk-test".to_string(),
            groq_api_key: String::new(),
            openai_base_url: "http://127.0.0.1:9/v1".to_string(),
            groq_base_url: "http://127.0.0.1:9/v1".to_string(),
            youtube_audio_dir: root.join("youtube"),
            ytdlp_bin: "yt-dlp-no-instalado".to_string(),
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}
