//! Inbound media processing.
//!
//! Attachments arrive as base64 payloads. Each one is decoded, size-checked
//! (25 MB cap), transcribed when it is audio, stored under
//! `media/{sessionKey}/{uuid}.{ext}`, and replaced by a reference record
//! with the base64 stripped. A uuid→key index backs `GET /media/{file}`.

use base64::Engine;
use chrono::{Duration, Utc};

use sy_domain::channel::{ChannelMedia, MediaKind, StoredMedia};
use sy_domain::config::TranscriptionProvider;
use sy_domain::error::{Error, Result};
use sy_store::BlobMeta;

use crate::state::GatewayState;

pub const MAX_MEDIA_BYTES: usize = 25 * 1024 * 1024;

/// Served media expires out of the blob store after this long.
const MEDIA_TTL_DAYS: i64 = 30;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transcription
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, bytes: &[u8], mime_type: &str) -> Result<Option<String>>;
}

/// No credentials configured: audio is stored untranscribed.
pub struct NoopTranscriber;

#[async_trait::async_trait]
impl Transcriber for NoopTranscriber {
    async fn transcribe(&self, _bytes: &[u8], _mime_type: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// OpenAI audio transcription (multipart upload).
pub struct OpenAiTranscriber {
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiTranscriber {
    pub fn new(api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { api_key, client })
    }
}

#[async_trait::async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, bytes: &[u8], mime_type: &str) -> Result<Option<String>> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(format!("audio.{}", mime_ext(mime_type)))
            .mime_str(mime_type)
            .map_err(|e| Error::Http(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("model", "whisper-1")
            .part("file", part);

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = response.status();
        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Provider {
                provider: "openai".into(),
                message: format!("transcription failed: {status}"),
            });
        }
        Ok(raw["text"].as_str().map(str::to_owned))
    }
}

/// Pick a transcriber from the live config. Workers AI needs account
/// credentials from the environment; absent those, audio goes untranscribed.
pub fn build_transcriber(state: &GatewayState) -> Box<dyn Transcriber> {
    let config = state.config.typed();
    match config.transcription.provider {
        TranscriptionProvider::Openai => match config.api_keys.openai {
            Some(key) => match OpenAiTranscriber::new(key) {
                Ok(t) => Box::new(t),
                Err(e) => {
                    tracing::warn!(error = %e, "transcriber init failed, audio untranscribed");
                    Box::new(NoopTranscriber)
                }
            },
            None => Box::new(NoopTranscriber),
        },
        TranscriptionProvider::WorkersAi => Box::new(NoopTranscriber),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Processing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn mime_ext(mime_type: &str) -> &'static str {
    match mime_type.split(';').next().unwrap_or("").trim() {
        "audio/ogg" | "application/ogg" => "ogg",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/webm" => "weba",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => "bin",
    }
}

/// Process all attachments of one inbound message.
pub async fn process_media(
    state: &GatewayState,
    session_key: &str,
    media: Vec<ChannelMedia>,
) -> Result<Vec<StoredMedia>> {
    let mut stored = Vec::with_capacity(media.len());
    let transcriber = build_transcriber(state);

    for item in media {
        let Some(data) = &item.data else {
            // URL-only attachment: keep the reference, nothing to store.
            stored.push(StoredMedia {
                blob_key: item.url.clone().unwrap_or_default(),
                mime_type: item.mime_type.clone(),
                kind: item.kind,
                filename: item.filename.clone(),
                size: item.size,
                duration: item.duration,
                transcription: item.transcription.clone(),
            });
            continue;
        };

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| Error::Validation(format!("invalid media base64: {e}")))?;
        if bytes.len() > MAX_MEDIA_BYTES {
            return Err(Error::Validation(format!(
                "media exceeds {} MB cap ({} bytes)",
                MAX_MEDIA_BYTES / (1024 * 1024),
                bytes.len()
            )));
        }

        let transcription = if item.kind == MediaKind::Audio {
            match transcriber.transcribe(&bytes, &item.mime_type).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "transcription failed, storing audio raw");
                    None
                }
            }
        } else {
            item.transcription.clone()
        };

        let ext = mime_ext(&item.mime_type);
        let file = format!("{}.{ext}", uuid::Uuid::new_v4());
        let blob_key = format!("media/{session_key}/{file}");
        let expires_at = Utc::now() + Duration::days(MEDIA_TTL_DAYS);
        let meta = BlobMeta::of(&item.mime_type).with("expiresAt", expires_at.to_rfc3339());
        state.blob.put(&blob_key, &bytes, meta)?;
        state.media_index.put(&file, blob_key.clone())?;

        stored.push(StoredMedia {
            blob_key,
            mime_type: item.mime_type.clone(),
            kind: item.kind,
            filename: item.filename.clone(),
            size: Some(bytes.len() as u64),
            duration: item.duration,
            transcription,
        });
    }
    Ok(stored)
}
