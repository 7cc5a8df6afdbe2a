use crate::{error::{AppError, AppResult}, state::AppState};
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::TryStreamExt;
use tracing::{info, warn};

/// Accepted multipart field names for the audio file.
const AUDIO_FIELDS: &[&str] = &["audio_file", "audio"];

/// A validated audio upload.
#[derive(Debug)]
pub struct AudioUpload {
    pub filename: Option<String>,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// `POST /api/v1/speech-to-text`
///
/// Takes a multipart upload with the audio in field `audio_file` and returns the
/// recognition result. Recognition failures surface as 500 with the upstream detail.
pub async fn speech_to_text(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> AppResult<HttpResponse> {
    let max_upload_bytes = state.get_config().limits.max_upload_bytes;
    let upload = read_audio_upload(&mut payload, max_upload_bytes).await?;

    info!(
        filename = upload.filename.as_deref().unwrap_or("-"),
        content_type = %upload.content_type,
        bytes = upload.bytes.len(),
        "Audio upload received"
    );

    let _active = state.begin_recognition(upload.bytes.len());
    let result = state
        .gateway()
        .speech_to_text(upload.bytes, &upload.content_type)
        .await;
    state.record_recognition(&result);

    if result.success {
        Ok(HttpResponse::Ok().json(result))
    } else {
        let message = result
            .error
            .unwrap_or_else(|| "speech recognition failed".to_string());
        Err(AppError::RecognitionFailed(message))
    }
}

/// Pull the audio field out of the multipart stream, validating it in order:
/// presence, content type, non-empty, size.
pub async fn read_audio_upload(payload: &mut Multipart, max_bytes: usize) -> Result<AudioUpload, AppError> {
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let is_audio_field = field.name().map(|name| AUDIO_FIELDS.contains(&name)).unwrap_or(false);
        if !is_audio_field {
            continue;
        }

        let content_type = field
            .content_type()
            .map(|mime| mime.to_string())
            .unwrap_or_default();
        if !content_type.to_ascii_lowercase().starts_with("audio/") {
            warn!(content_type = %content_type, "Rejected upload with non-audio content type");
            return Err(AppError::ValidationError(
                "uploaded file is not a valid audio file".to_string(),
            ));
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);

        let mut bytes = Vec::new();
        while let Some(chunk) = field
            .try_next()
            .await
            .map_err(|e| AppError::BadRequest(format!("failed to read upload: {}", e)))?
        {
            if bytes.len() + chunk.len() > max_bytes {
                return Err(AppError::ValidationError(format!(
                    "audio file too large (limit {} bytes)",
                    max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        if bytes.is_empty() {
            return Err(AppError::ValidationError("audio file is empty".to_string()));
        }

        return Ok(AudioUpload {
            filename,
            content_type,
            bytes,
        });
    }

    Err(AppError::ValidationError(
        "missing audio file field `audio_file`".to_string(),
    ))
}
