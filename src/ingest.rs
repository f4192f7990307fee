//! Ingesta de un único documento (sitio web, vídeo de YouTube, PDF, CSV o TXT)
//! y su conversión a un bloque de texto plano.
//!
//! Cada tipo delega el análisis en un adaptador externo; las unidades
//! extraídas (páginas, filas, segmentos) se unen con una línea en blanco.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use mime_guess::MimeGuess;
use rand::seq::SliceRandom;
use reqwest::header::USER_AGENT;
use scraper::Html;
use tokio::process::Command;
use tracing::{error, info, warn};
use url::Url;
use walkdir::WalkDir;

use crate::{config::AppConfig, error::LoaderError, llm::LlmManager, models::SourceType};

const UNIT_SEPARATOR: &str = "\n\n";

/// Número de intentos y pausa fija entre ellos al cargar un sitio.
pub const SITE_MAX_ATTEMPTS: u32 = 5;
pub const SITE_RETRY_DELAY: Duration = Duration::from_secs(3);

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

/// Lo que el usuario entrega para un documento.
#[derive(Debug, Clone)]
pub enum DocumentInput {
    /// URL del sitio, o id/URL del vídeo.
    Locator(String),
    /// Fichero subido, mantenido en memoria.
    Upload { file_name: String, data: Vec<u8> },
}

#[derive(Clone)]
pub struct DocumentLoader {
    http: reqwest::Client,
    llm: LlmManager,
    max_attempts: u32,
    retry_delay: Duration,
    audio_dir: PathBuf,
    ytdlp_bin: String,
}

impl DocumentLoader {
    pub fn from_config(cfg: &AppConfig, llm: LlmManager) -> Self {
        Self {
            http: reqwest::Client::new(),
            llm,
            max_attempts: SITE_MAX_ATTEMPTS,
            retry_delay: SITE_RETRY_DELAY,
            audio_dir: cfg.youtube_audio_dir.clone(),
            ytdlp_bin: cfg.ytdlp_bin.clone(),
        }
    }

    /// Cambia la política de reintentos de los sitios.
    #[cfg(test)]
    fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Carga el documento y lo aplana a un único texto.
    pub async fn load(
        &self,
        source_type: SourceType,
        input: DocumentInput,
    ) -> Result<String, LoaderError> {
        match (source_type, input) {
            (SourceType::Site, DocumentInput::Locator(url)) => self.load_site(&url).await,
            (SourceType::Youtube, DocumentInput::Locator(locator)) => {
                self.load_youtube(&locator).await
            }
            (SourceType::Pdf, DocumentInput::Upload { file_name, data }) => {
                check_upload_type(SourceType::Pdf, &file_name)?;
                load_pdf(data).await
            }
            (SourceType::Csv, DocumentInput::Upload { file_name, data }) => {
                check_upload_type(SourceType::Csv, &file_name)?;
                load_csv(&data)
            }
            (SourceType::Txt, DocumentInput::Upload { file_name, data }) => {
                check_upload_type(SourceType::Txt, &file_name)?;
                load_txt(data)
            }
            (source_type, _) => Err(LoaderError::InvalidLocator(format!(
                "entrada no válida para un documento {source_type}"
            ))),
        }
    }

    // ---------------------------------------------------------------------
    // SITIOS
    // ---------------------------------------------------------------------

    /// Descarga un sitio con reintentos de pausa fija. Agotados los intentos
    /// devuelve `SiteExhausted`; un sitio sin texto no se reintenta.
    pub async fn load_site(&self, url: &str) -> Result<String, LoaderError> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| LoaderError::InvalidLocator(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(LoaderError::InvalidLocator(format!(
                "{url}: sólo se admiten URLs http(s)"
            )));
        }

        for attempt in 1..=self.max_attempts {
            match self.fetch_site(&parsed).await {
                Ok(text) if text.trim().is_empty() => {
                    return Err(LoaderError::EmptyDocument(SourceType::Site));
                }
                Ok(text) => {
                    info!("Sitio {} cargado en el intento {} ({} caracteres)", parsed, attempt, text.len());
                    return Ok(text);
                }
                Err(err) => {
                    warn!("Error al cargar el sitio {} (intento {}/{}): {}", parsed, attempt, self.max_attempts, err);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        error!("No se pudo cargar el sitio {} tras {} intentos", parsed, self.max_attempts);
        Err(LoaderError::SiteExhausted {
            url: url.to_string(),
            attempts: self.max_attempts,
        })
    }

    async fn fetch_site(&self, url: &Url) -> Result<String, LoaderError> {
        let html = self
            .http
            .get(url.as_str())
            .header(USER_AGENT, random_user_agent())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(html_to_text(&html))
    }

    // ---------------------------------------------------------------------
    // YOUTUBE
    // ---------------------------------------------------------------------

    /// Descarga el audio del vídeo con `yt-dlp` y lo transcribe con Whisper.
    pub async fn load_youtube(&self, locator: &str) -> Result<String, LoaderError> {
        let video_id = youtube_video_id(locator)?;
        let audio_files = self.download_audio(&video_id).await?;

        let mut segments = Vec::with_capacity(audio_files.len());
        for audio in &audio_files {
            segments.push(self.llm.transcribe(audio).await?);
        }
        Ok(segments.join(UNIT_SEPARATOR))
    }

    async fn download_audio(&self, video_id: &str) -> Result<Vec<PathBuf>, LoaderError> {
        tokio::fs::create_dir_all(&self.audio_dir).await?;

        let url = format!("https://www.youtube.com/watch?v={video_id}");
        let template = self.audio_dir.join(format!("{video_id}.%(ext)s"));
        info!("Descargando audio de {} en {}", url, self.audio_dir.display());

        let output = Command::new(&self.ytdlp_bin)
            .arg("--no-playlist")
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg("m4a")
            .arg("--output")
            .arg(&template)
            .arg("--")
            .arg(&url)
            .output()
            .await
            .map_err(|e| {
                LoaderError::AudioDownload(format!("no se pudo ejecutar '{}': {e}", self.ytdlp_bin))
            })?;

        if !output.status.success() {
            return Err(LoaderError::AudioDownload(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let files = audio_files_for(&self.audio_dir, video_id);
        if files.is_empty() {
            return Err(LoaderError::AudioDownload(format!(
                "yt-dlp no generó audio para {video_id}"
            )));
        }
        Ok(files)
    }
}

fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Texto visible de una página: nodos de texto fuera de script/style, uno por línea.
fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);

    document
        .tree
        .root()
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let hidden = node.ancestors().any(|ancestor| {
                ancestor.value().as_element().is_some_and(|el| {
                    matches!(el.name(), "script" | "style" | "noscript" | "template")
                })
            });
            let trimmed = text.trim();
            (!hidden && !trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extrae el id de un vídeo a partir de un id suelto o de una URL de YouTube.
pub fn youtube_video_id(locator: &str) -> Result<String, LoaderError> {
    let locator = locator.trim();
    let invalid = || LoaderError::InvalidLocator(format!("vídeo de YouTube no reconocido: {locator}"));

    let candidate = match Url::parse(locator) {
        Ok(url) => {
            let host = url.host_str().unwrap_or_default().trim_start_matches("www.");
            let mut segments = url.path_segments().into_iter().flatten().filter(|s| !s.is_empty());
            let id = match host {
                "youtu.be" => segments.next().map(str::to_string),
                "youtube.com" | "m.youtube.com" | "music.youtube.com" => {
                    match segments.next() {
                        Some("watch") => url
                            .query_pairs()
                            .find(|(k, _)| k == "v")
                            .map(|(_, v)| v.into_owned()),
                        Some("shorts") | Some("embed") | Some("live") => {
                            segments.next().map(str::to_string)
                        }
                        _ => None,
                    }
                }
                _ => None,
            };
            id.ok_or_else(invalid)?
        }
        Err(_) => locator.to_string(),
    };

    let valid = !candidate.is_empty()
        && candidate.len() <= 64
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(candidate)
    } else {
        Err(invalid())
    }
}

fn audio_files_for(dir: &Path, video_id: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.file_stem().and_then(|s| s.to_str()) == Some(video_id)
                && p.extension().and_then(|e| e.to_str()) != Some("part")
        })
        .collect();
    files.sort();
    files
}

// -------------------------------------------------------------------------
// FICHEROS SUBIDOS
// -------------------------------------------------------------------------

/// Rechaza un fichero cuya extensión indica otro tipo distinto del declarado.
fn check_upload_type(source_type: SourceType, file_name: &str) -> Result<(), LoaderError> {
    let expected = match source_type {
        SourceType::Pdf => "application/pdf",
        SourceType::Csv => "text/csv",
        SourceType::Txt => "text/plain",
        SourceType::Site | SourceType::Youtube => return Ok(()),
    };
    match MimeGuess::from_path(file_name).first() {
        Some(mime) if mime.essence_str() != expected => Err(LoaderError::InvalidLocator(format!(
            "'{file_name}' no es un fichero {source_type} ({mime})"
        ))),
        _ => Ok(()),
    }
}

/// Texto de cada página del PDF, separado por una línea en blanco.
pub async fn load_pdf(data: Vec<u8>) -> Result<String, LoaderError> {
    let pages = tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem_by_pages(&data).map_err(|e| LoaderError::Pdf(e.to_string()))
    })
    .await
    .map_err(|e| LoaderError::Pdf(e.to_string()))??;

    info!("PDF cargado: {} páginas", pages.len());
    Ok(pages.join(UNIT_SEPARATOR))
}

/// Cada fila como líneas `cabecera: valor`; filas separadas por una línea en blanco.
pub fn load_csv(data: &[u8]) -> Result<String, LoaderError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(data);
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| format!("{}: {}", header.trim(), value.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        rows.push(row);
    }

    info!("CSV cargado: {} filas", rows.len());
    Ok(rows.join(UNIT_SEPARATOR))
}

pub fn load_txt(data: Vec<u8>) -> Result<String, LoaderError> {
    Ok(String::from_utf8(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, response::Html as HtmlResponse, routing::get, Router};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tempfile::tempdir;
    use tokio_test::assert_err;

    fn loader(root: &Path) -> DocumentLoader {
        let cfg = AppConfig::for_tests(root);
        DocumentLoader::from_config(&cfg, LlmManager::from_config(&cfg))
            .with_retry(SITE_MAX_ATTEMPTS, Duration::ZERO)
    }

    /// Servidor local que falla `failures` veces antes de servir la página.
    async fn flaky_site(failures: usize, page: &'static str) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        Err(StatusCode::INTERNAL_SERVER_ERROR)
                    } else {
                        Ok(HtmlResponse(page))
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), hits)
    }

    #[tokio::test]
    async fn always_failing_site_is_tried_exactly_five_times() {
        let tmp = tempdir().unwrap();
        let (url, hits) = flaky_site(usize::MAX, "").await;

        let err = assert_err!(loader(tmp.path()).load_site(&url).await);
        assert!(matches!(err, LoaderError::SiteExhausted { attempts: 5, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn site_recovers_after_transient_failures() {
        let tmp = tempdir().unwrap();
        let page = "<html><head><title>Título</title><style>p{}</style></head>\
                    <body><p>Hola</p><script>var x = 1;</script><div> mundo </div></body></html>";
        let (url, hits) = flaky_site(2, page).await;

        let text = loader(tmp.path())
            .load(SourceType::Site, DocumentInput::Locator(url))
            .await
            .unwrap();
        assert_eq!(text, "Título\nHola\nmundo");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_site_is_not_retried() {
        let tmp = tempdir().unwrap();
        let (url, hits) = flaky_site(0, "<html><body>  </body></html>").await;

        let err = assert_err!(loader(tmp.path()).load_site(&url).await);
        assert!(matches!(err, LoaderError::EmptyDocument(SourceType::Site)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_http_locator_is_rejected_without_attempts() {
        let tmp = tempdir().unwrap();
        let err = assert_err!(loader(tmp.path()).load_site("ftp://ejemplo.com/doc").await);
        assert!(matches!(err, LoaderError::InvalidLocator(_)));
    }

    #[test]
    fn csv_rows_become_key_value_blocks() {
        let data = b"nombre, edad\nAna, 31\nLuis,40\n";
        let text = load_csv(data).unwrap();
        assert_eq!(text, "nombre: Ana\nedad: 31\n\nnombre: Luis\nedad: 40");
    }

    #[test]
    fn txt_must_be_utf8() {
        assert_eq!(load_txt("línea".as_bytes().to_vec()).unwrap(), "línea");
        assert!(matches!(load_txt(vec![0xff, 0xfe, 0x00]), Err(LoaderError::Encoding(_))));
    }

    #[tokio::test]
    async fn garbage_pdf_is_a_parse_error() {
        let err = assert_err!(load_pdf(b"esto no es un pdf".to_vec()).await);
        assert!(matches!(err, LoaderError::Pdf(_)));
    }

    #[tokio::test]
    async fn upload_extension_must_match_declared_type() {
        let tmp = tempdir().unwrap();
        let input = DocumentInput::Upload {
            file_name: "datos.pdf".into(),
            data: b"a,b\n1,2\n".to_vec(),
        };
        let err = assert_err!(loader(tmp.path()).load(SourceType::Csv, input).await);
        assert!(matches!(err, LoaderError::InvalidLocator(_)));

        let ok = DocumentInput::Upload {
            file_name: "datos.csv".into(),
            data: b"a,b\n1,2\n".to_vec(),
        };
        assert_eq!(
            loader(tmp.path()).load(SourceType::Csv, ok).await.unwrap(),
            "a: 1\nb: 2"
        );
    }

    #[tokio::test]
    async fn mismatched_input_kind_is_rejected() {
        let tmp = tempdir().unwrap();
        let err = assert_err!(
            loader(tmp.path())
                .load(SourceType::Pdf, DocumentInput::Locator("x.pdf".into()))
                .await
        );
        assert!(matches!(err, LoaderError::InvalidLocator(_)));
    }

    #[test]
    fn video_ids_are_extracted_from_urls() {
        for locator in [
            "dQw4w9WgXcQ",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://youtube.com/shorts/dQw4w9WgXcQ",
            "  https://m.youtube.com/watch?v=dQw4w9WgXcQ  ",
        ] {
            assert_eq!(youtube_video_id(locator).unwrap(), "dQw4w9WgXcQ", "{locator}");
        }
        assert!(youtube_video_id("https://vimeo.com/123").is_err());
        assert!(youtube_video_id("id con espacios").is_err());
        assert!(youtube_video_id("").is_err());
    }

    #[tokio::test]
    async fn missing_downloader_is_reported() {
        let tmp = tempdir().unwrap();
        let err = assert_err!(loader(tmp.path()).load_youtube("dQw4w9WgXcQ").await);
        assert!(matches!(err, LoaderError::AudioDownload(_)));
    }

    #[test]
    fn audio_files_match_video_stem_only() {
        let tmp = tempdir().unwrap();
        for name in ["abc.m4a", "abc.m4a.part", "abcd.m4a", "abc.part"] {
            std::fs::write(tmp.path().join(name), b"").unwrap();
        }
        let files = audio_files_for(tmp.path(), "abc");
        assert_eq!(files, vec![tmp.path().join("abc.m4a")]);
    }
}
