//! # Speech Gateway
//!
//! Owns one recognition from start to finish:
//!
//! 1. Refuse early (no I/O) when credentials are missing
//! 2. Normalize the audio on the blocking pool
//! 3. Sign the URL and connect
//! 4. Stream every frame, then read events until the final one
//! 5. Close the connection, whatever happened
//!
//! Every failure is turned into a [`RecognitionResult`] here. A receive wait that
//! runs out is not a failure: the transcript gathered so far is returned with
//! status `partial`.

use super::connection::{Connector, UpstreamConnection};
use super::error::SpeechError;
use super::frames::FrameStreamer;
use super::protocol::{decode_event, InboundEvent};
use super::signer::{rfc1123_date, sign_url};
use super::transcript::{Phase, TranscriptAssembler};
use super::{GatewayConfig, RecognitionResult};
use crate::audio::pcm::duration_ms;
use crate::audio::{AudioClip, AudioNormalizer, NormalizedAudio};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Characters of the signed URL that are safe to log (never the signature).
const LOGGED_URL_CHARS: usize = 50;

/// How the receive phase ended.
#[derive(Debug, PartialEq)]
enum Outcome {
    Final(String),
    TimedOut(String),
}

pub struct SpeechGateway {
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    normalizer: Arc<AudioNormalizer>,
}

impl SpeechGateway {
    pub fn new(config: GatewayConfig, connector: Arc<dyn Connector>, normalizer: Arc<AudioNormalizer>) -> Self {
        Self {
            config,
            connector,
            normalizer,
        }
    }

    #[cfg(test)]
    pub(crate) fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Recognize one clip. Never panics and never returns an error: failures are
    /// reported through `success: false`.
    pub async fn speech_to_text(&self, audio: Vec<u8>, content_type: &str) -> RecognitionResult {
        if !self.config.credential.is_complete() {
            error!("speech credentials are not configured, set XUNFEI_APP_ID, XUNFEI_API_KEY and XUNFEI_API_SECRET");
            return RecognitionResult::failed(&SpeechError::Configuration);
        }

        info!(bytes = audio.len(), content_type, "starting speech recognition");

        let normalized = self.normalize(AudioClip::new(audio, content_type)).await;
        info!(
            pcm_bytes = normalized.pcm.len(),
            duration_ms = duration_ms(normalized.pcm.len()),
            converter = normalized.converter,
            degraded = normalized.degraded,
            "audio ready for upstream"
        );

        match self.recognize(&normalized.pcm).await {
            Ok(Outcome::Final(text)) => {
                info!(chars = text.chars().count(), "speech recognition completed");
                RecognitionResult::completed(text)
            }
            Ok(Outcome::TimedOut(text)) => RecognitionResult::partial(text),
            Err(err) => {
                error!(kind = err.kind(), error = %err, "speech recognition failed");
                RecognitionResult::failed(&err)
            }
        }
    }

    async fn normalize(&self, clip: AudioClip) -> NormalizedAudio {
        let clip = Arc::new(clip);
        let normalizer = Arc::clone(&self.normalizer);
        let task_clip = Arc::clone(&clip);

        match tokio::task::spawn_blocking(move || normalizer.normalize(&task_clip)).await {
            Ok(normalized) => normalized,
            Err(err) => {
                error!(error = %err, "audio normalization task failed, sending original bytes");
                NormalizedAudio::passthrough(clip.bytes.clone())
            }
        }
    }

    async fn recognize(&self, pcm: &[u8]) -> Result<Outcome, SpeechError> {
        let date = rfc1123_date(Utc::now());
        let url = sign_url(&self.config.credential, &self.config.endpoint, &date).map_err(|e| {
            SpeechError::Connection {
                status: None,
                reason: format!("cannot sign connection URL: {}", e),
            }
        })?;
        let url_prefix: String = url.chars().take(LOGGED_URL_CHARS).collect();
        info!(url = %url_prefix, "connecting to speech service");

        let mut connection = self
            .connector
            .connect(&url, self.config.connect_timeout)
            .await?;
        debug!("speech service connected");

        let outcome = self.exchange(connection.as_mut(), pcm).await;
        connection.close().await;
        outcome
    }

    /// Send all frames, then read events until the transcript closes.
    async fn exchange(&self, connection: &mut dyn UpstreamConnection, pcm: &[u8]) -> Result<Outcome, SpeechError> {
        let streamer = FrameStreamer::new(
            &self.config.credential.app_id,
            &self.config.session,
            self.config.frame_size,
            self.config.frame_interval,
        );

        // A failed send usually means the upstream hung up; its reason may still be queued
        let send_error = match streamer.stream(connection, pcm).await {
            Ok(stats) => {
                debug!(frames = stats.frames, bytes = stats.bytes, "all audio frames sent");
                None
            }
            Err(err) => {
                warn!(error = %err, "sending audio stopped early, checking for an upstream error");
                Some(err)
            }
        };

        let mut assembler = TranscriptAssembler::new();

        loop {
            let next = tokio::time::timeout(self.config.receive_timeout, connection.next_text()).await;

            let text = match next {
                Err(_elapsed) => {
                    if let Some(err) = send_error {
                        return Err(err);
                    }
                    warn!(
                        timeout_secs = self.config.receive_timeout.as_secs(),
                        partial = assembler.text(),
                        "no final result before timeout, returning partial transcript"
                    );
                    assembler.finish();
                    return Ok(Outcome::TimedOut(assembler.text().to_string()));
                }
                Ok(None) => {
                    return Err(send_error.unwrap_or_else(|| {
                        SpeechError::Transport("connection closed before the final result".to_string())
                    }));
                }
                Ok(Some(Err(err))) => return Err(err),
                Ok(Some(Ok(text))) => text,
            };

            match decode_event(&text)? {
                InboundEvent::Error { code, message } => {
                    error!(code, %message, "speech service returned an error");
                    assembler.fail(code, message);
                }
                InboundEvent::Result { segments, mode, is_final } => {
                    assembler.apply(&segments, mode, is_final);
                    debug!(?mode, is_final, text = assembler.text(), "recognition result received");
                }
            }

            match assembler.phase() {
                Phase::Listening => continue,
                Phase::Done => return Ok(Outcome::Final(assembler.text().to_string())),
                Phase::Failed { code, message } => {
                    return Err(SpeechError::Protocol {
                        code: *code,
                        message: message.clone(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::test_support::wav_bytes;
    use crate::config::AppConfig;
    use crate::speech::connection::scripted::ScriptedConnector;
    use crate::speech::RecognitionStatus;
    use std::time::Duration;
    use tokio::time::Instant;

    const PARTIAL_NI_HAO: &str = r#"{"code":0,"message":"success","sid":"iat1","data":{"status":1,"result":{"pgs":"rpl","ws":[{"bg":0,"ed":0,"cw":[{"w":"你好"}]}]}}}"#;
    const PARTIAL_WORLD: &str = r#"{"code":0,"message":"success","sid":"iat1","data":{"status":1,"result":{"pgs":"apd","ws":[{"bg":40,"ed":0,"cw":[{"w":"，世界"}]}]}}}"#;
    const FINAL_EMPTY: &str = r#"{"code":0,"message":"success","sid":"iat1","data":{"status":2,"result":{"ws":[]}}}"#;
    const PARAMETER_ERROR: &str = r#"{"code":10163,"message":"parameter error","sid":"iat1"}"#;

    fn configured() -> GatewayConfig {
        let mut config = AppConfig::default();
        config.speech.app_id = "app-1".to_string();
        config.speech.api_key = "key-1".to_string();
        config.speech.api_secret = "secret-1".to_string();
        config.speech.gateway_config()
    }

    fn gateway(config: GatewayConfig, connector: &ScriptedConnector) -> SpeechGateway {
        SpeechGateway::new(
            config,
            Arc::new(connector.clone()),
            Arc::new(AudioNormalizer::standard("/nonexistent/bin/ffmpeg")),
        )
    }

    fn pcm(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_assembles_text() {
        let connector = ScriptedConnector::replying(&[PARTIAL_NI_HAO, PARTIAL_WORLD, FINAL_EMPTY]);
        let result = gateway(configured(), &connector)
            .speech_to_text(pcm(3200), "audio/pcm")
            .await;

        assert_eq!(result, RecognitionResult::completed("你好，世界"));
        assert_eq!(connector.connect_count(), 1);
        assert!(connector.was_closed());

        let sent = connector.sent_messages();
        let statuses: Vec<u64> = sent.iter().map(|m| m["data"]["status"].as_u64().unwrap()).collect();
        assert_eq!(statuses, vec![0, 1, 2]);
        assert_eq!(sent[0]["common"]["app_id"], "app-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_with_signed_url() {
        let connector = ScriptedConnector::replying(&[FINAL_EMPTY]);
        gateway(configured(), &connector)
            .speech_to_text(pcm(640), "audio/pcm")
            .await;

        let urls = connector.urls.lock().unwrap().clone();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].starts_with("wss://iat-api.xfyun.cn/v2/iat?authorization="));
        assert!(urls[0].contains("&date="));
        assert!(urls[0].ends_with("&host=iat-api.xfyun.cn"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credentials_never_connect() {
        let mut config = configured();
        config.credential.api_secret.clear();
        let connector = ScriptedConnector::replying(&[FINAL_EMPTY]);

        let result = gateway(config, &connector).speech_to_text(pcm(3200), "audio/pcm").await;

        assert!(!result.success);
        assert_eq!(result.status, RecognitionStatus::Failed);
        let error = result.error.unwrap();
        assert!(error.contains("configuration incomplete"));
        assert!(error.contains("配置不完整"));
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_error_fails_request() {
        let connector = ScriptedConnector::replying(&[PARAMETER_ERROR, FINAL_EMPTY]);
        let result = gateway(configured(), &connector)
            .speech_to_text(pcm(3200), "audio/pcm")
            .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("10163"));
        assert_eq!(result.error_kind, Some("protocol"));
        assert!(connector.was_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_partial_transcript() {
        let connector = ScriptedConnector {
            hang: true,
            ..ScriptedConnector::replying(&[PARTIAL_NI_HAO])
        };

        let started = Instant::now();
        let result = gateway(configured(), &connector)
            .speech_to_text(pcm(1280), "audio/pcm")
            .await;

        assert!(result.success);
        assert_eq!(result.text.as_deref(), Some("你好"));
        assert_eq!(result.status, RecognitionStatus::Partial);
        assert!(Instant::now() - started >= Duration::from_secs(15));
        assert!(connector.was_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_rejection_is_reported() {
        let connector = ScriptedConnector {
            reject: Some(SpeechError::Connection {
                status: Some(401),
                reason: "HMAC signature cannot be verified".to_string(),
            }),
            ..Default::default()
        };

        let result = gateway(configured(), &connector)
            .speech_to_text(pcm(3200), "audio/pcm")
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some("connection"));
        let error = result.error.unwrap();
        assert!(error.contains("401"));
        assert!(error.contains("HMAC signature cannot be verified"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_still_reads_upstream_error() {
        let connector = ScriptedConnector {
            fail_send_at: Some(1),
            ..ScriptedConnector::replying(&[r#"{"code":10165,"message":"invalid handle"}"#])
        };

        let result = gateway(configured(), &connector)
            .speech_to_text(pcm(5000), "audio/pcm")
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("10165"));
        assert!(connector.was_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_without_reply_reports_transport() {
        let connector = ScriptedConnector {
            fail_send_at: Some(0),
            ..Default::default()
        };

        let result = gateway(configured(), &connector)
            .speech_to_text(pcm(5000), "audio/pcm")
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some("transport"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_event_fails_request() {
        let connector = ScriptedConnector::replying(&["<html>bad gateway</html>"]);
        let result = gateway(configured(), &connector)
            .speech_to_text(pcm(1280), "audio/pcm")
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some("malformed_event"));
        assert!(connector.was_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_frame_carries_session_parameters() {
        let connector = ScriptedConnector::replying(&[FINAL_EMPTY]);
        gateway(configured(), &connector)
            .speech_to_text(pcm(600), "audio/pcm")
            .await;

        let sent = connector.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["data"]["status"], 2);
        assert_eq!(sent[0]["business"]["language"], "zh_cn");
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_only_wav_still_closes_the_session() {
        let connector = ScriptedConnector::replying(&[FINAL_EMPTY]);
        let result = gateway(configured(), &connector)
            .speech_to_text(wav_bytes(1, 16_000, &[]), "audio/wav")
            .await;

        assert_eq!(result.status, RecognitionStatus::Completed);
        let sent = connector.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["data"]["status"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconvertible_audio_is_sent_as_is() {
        let original: Vec<u8> = (0..=255u8).cycle().take(2000).collect();
        let connector = ScriptedConnector::replying(&[FINAL_EMPTY]);
        let result = gateway(configured(), &connector)
            .speech_to_text(original.clone(), "audio/x-unknown")
            .await;
        assert!(result.success);

        let sent_audio: Vec<u8> = connector
            .sent_messages()
            .iter()
            .flat_map(|m| {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(m["data"]["audio"].as_str().unwrap())
                    .unwrap()
            })
            .collect();
        assert_eq!(sent_audio, original);
    }
}
