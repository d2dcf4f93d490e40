//! Detects embedded cover art in an input already written to the engine.
//!
//! The probe is `ffmpeg -i <input>` with no output, which prints the stream
//! listing and then exits with an error. Text from either outcome is
//! searched.

use crate::engine::{Engine, EngineError};

/// Stream index of the first stream after the primary audio.
pub const SECONDARY_STREAM_MARKER: &str = "Stream #0:1";

pub fn probe_args(input_name: &str) -> Vec<String> {
    vec!["-i".to_string(), input_name.to_string()]
}

#[tracing::instrument(skip(engine))]
pub async fn has_secondary_stream(engine: &dyn Engine, input_name: &str) -> bool {
    let text = match engine.exec(&probe_args(input_name)).await {
        Ok(output) => output.log,
        Err(EngineError::Exec { diagnostic, .. }) => diagnostic,
        Err(e) => {
            tracing::debug!(error = %e, "probe gave no output");
            return false;
        }
    };
    let found = lists_secondary_stream(&text);
    tracing::debug!(found, "probe");
    found
}

/// True when the listing has a picture stream at the secondary index.
pub fn lists_secondary_stream(text: &str) -> bool {
    text.lines()
        .any(|l| l.contains(SECONDARY_STREAM_MARKER) && l.contains("Video:"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineOp, ScriptedEngine};

    const WITH_ART: &str = "Input #0, mp3, from 'input.mp3':
  Duration: 00:03:12.41, start: 0.025057, bitrate: 320 kb/s
  Stream #0:0: Audio: mp3, 44100 Hz, stereo, fltp, 320 kb/s
  Stream #0:1: Video: mjpeg (Baseline), yuvj420p(pc), 500x500, 90k tbr (attached pic)";

    const AUDIO_ONLY: &str = "Input #0, wav, from 'input.wav':
  Duration: 00:00:04.00, bitrate: 1411 kb/s
  Stream #0:0: Audio: pcm_s16le ([1][0][0][0] / 0x0001), 44100 Hz, stereo, s16, 1411 kb/s";

    #[test]
    fn test_listing() {
        assert!(lists_secondary_stream(WITH_ART));
        assert!(!lists_secondary_stream(AUDIO_ONLY));
        assert!(!lists_secondary_stream(""));
        assert!(!lists_secondary_stream(
            "  Stream #0:1(eng): Audio: aac (LC), 48000 Hz, stereo"
        ));
        assert!(lists_secondary_stream(
            "  Stream #0:1[0x2](und): Video: png, rgb24, 600x600 (attached pic)"
        ));
    }

    #[tokio::test]
    async fn test_failed_probe_is_read() {
        let engine = ScriptedEngine::new().with_probe_text(WITH_ART);
        assert!(has_secondary_stream(&engine, "input.mp3").await);
        assert_eq!(
            engine.journal(),
            [EngineOp::Exec(vec!["-i".to_string(), "input.mp3".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_successful_probe_is_read() {
        let engine = ScriptedEngine::new()
            .with_probe_text(WITH_ART)
            .probe_succeeds();
        assert!(has_secondary_stream(&engine, "input.mp3").await);
    }

    #[tokio::test]
    async fn test_no_marker() {
        let engine = ScriptedEngine::new().with_probe_text(AUDIO_ONLY);
        assert!(!has_secondary_stream(&engine, "input.wav").await);
        let engine = ScriptedEngine::new().probe_succeeds();
        assert!(!has_secondary_stream(&engine, "input").await);
    }
}
