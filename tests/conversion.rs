use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use audio_format_converter::{
    asset::InputAsset,
    converter::{ConvertError, Converter},
    engine::{EngineOp, ScriptedEngine},
    relay::{ConversionEvent, ConversionObserver},
};

const COVER_ART_LISTING: &str = "Input #0, mp3, from 'input.mp3':
  Stream #0:0: Audio: mp3, 44100 Hz, stereo, fltp, 320 kb/s
  Stream #0:1: Video: mjpeg (Baseline), yuvj420p, 600x600, 90k tbr (attached pic)";

async fn loaded(engine: ScriptedEngine) -> (Arc<ScriptedEngine>, Arc<Converter>) {
    let engine = Arc::new(engine);
    let converter = Arc::new(Converter::new(engine.clone()));
    converter.load(None).await.unwrap();
    (engine, converter)
}

fn asset(media_type: &str, name: &str) -> InputAsset {
    InputAsset::new(b"some audio".to_vec(), media_type, Some(name.to_string()))
}

fn recorder() -> (Arc<dyn ConversionObserver>, Arc<Mutex<Vec<ConversionEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let observer: Arc<dyn ConversionObserver> =
        Arc::new(move |e: ConversionEvent| sink.lock().unwrap().push(e));
    (observer, events)
}

fn transcode_args(journal: &[EngineOp]) -> Vec<String> {
    journal
        .iter()
        .find_map(|op| match op {
            EngineOp::Exec(args) if !op.is_probe() => Some(args.clone()),
            _ => None,
        })
        .unwrap()
}

#[tokio::test]
async fn test_every_format_round_trip() {
    for format in ["mp3", "wav", "ogg", "flac", "aiff", "aac"] {
        let (_engine, converter) = loaded(ScriptedEngine::new()).await;
        let out = converter
            .convert(&asset("audio/wav", "take.wav"), format, None)
            .await
            .unwrap();
        assert_eq!(out.media_type(), format!("audio/{format}"));
        assert_eq!(out.data(), b"some audio");
        assert_eq!(out.file_name_for(Some("take.wav")), format!("take.{format}"));
    }
}

#[tokio::test]
async fn test_format_name_is_case_insensitive() {
    let (_engine, converter) = loaded(ScriptedEngine::new()).await;
    let out = converter
        .convert(&asset("audio/wav", "a.wav"), " FLAC ", None)
        .await
        .unwrap();
    assert_eq!(out.media_type(), "audio/flac");
}

#[tokio::test]
async fn test_cover_art_is_kept() {
    let (engine, converter) =
        loaded(ScriptedEngine::new().with_probe_text(COVER_ART_LISTING)).await;
    converter
        .convert(&asset("audio/mpeg", "song.mp3"), "mp3", None)
        .await
        .unwrap();
    let args = transcode_args(&engine.journal()).join(" ");
    assert!(args.contains("-map 0:a -map 0:v"), "{args}");
    assert!(args.contains("-c:v copy"), "{args}");
    assert!(args.contains("-id3v2_version 3"), "{args}");
}

#[tokio::test]
async fn test_audio_only_maps_audio() {
    let (engine, converter) = loaded(
        ScriptedEngine::new().with_probe_text("  Stream #0:0: Audio: pcm_s16le, 44100 Hz"),
    )
    .await;
    converter
        .convert(&asset("audio/wav", "a.wav"), "ogg", None)
        .await
        .unwrap();
    let args = transcode_args(&engine.journal());
    assert!(!args.iter().any(|a| a == "0:v"));
    assert!(!args.iter().any(|a| a == "-c:v"));
}

#[tokio::test]
async fn test_unsupported_format_never_reaches_engine() {
    let (engine, converter) = loaded(ScriptedEngine::new()).await;
    let (observer, events) = recorder();
    let err = converter
        .convert(&asset("audio/mpeg", "song.mp3"), "xyz", Some(observer))
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::UnsupportedFormat(_)));
    assert_eq!(err.to_string(), "unsupported format: xyz");
    assert_eq!(engine.call_count(), 0);
    assert!(events.lock().unwrap().is_empty());
    assert!(!converter.has_active_relay());
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let (_engine, converter) =
        loaded(ScriptedEngine::new().with_progress(vec![0.1, 0.5, 0.3, 0.5, 1.4])).await;
    let (observer, events) = recorder();
    converter
        .convert(&asset("audio/wav", "a.wav"), "mp3", Some(observer))
        .await
        .unwrap();
    let progress: Vec<u8> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ConversionEvent::Progress(p) => Some(*p),
            ConversionEvent::Log(_) => None,
        })
        .collect();
    assert_eq!(progress, [10, 50, 50, 100]);
}

#[tokio::test]
async fn test_observer_only_sees_its_own_conversion() {
    let (_engine, converter) = loaded(ScriptedEngine::new().with_progress(vec![1.0])).await;
    let (first, first_events) = recorder();
    converter
        .convert(&asset("audio/wav", "a.wav"), "mp3", Some(first))
        .await
        .unwrap();
    let seen = first_events.lock().unwrap().len();
    assert!(seen > 0);

    converter
        .convert(&asset("audio/wav", "b.wav"), "wav", None)
        .await
        .unwrap();
    assert_eq!(first_events.lock().unwrap().len(), seen);
}

#[tokio::test]
async fn test_relay_released_after_success_and_failure() {
    let (_engine, converter) = loaded(ScriptedEngine::new()).await;
    let (observer, _events) = recorder();
    converter
        .convert(&asset("audio/wav", "a.wav"), "mp3", Some(observer.clone()))
        .await
        .unwrap();
    assert!(!converter.has_active_relay());

    let (_engine, converter) =
        loaded(ScriptedEngine::new().with_exec_error("Invalid data found when processing input"))
            .await;
    let err = converter
        .convert(&asset("audio/wav", "a.wav"), "mp3", Some(observer))
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::Conversion(_)));
    assert!(err.to_string().contains("Invalid data found"), "{err}");
    assert!(!converter.has_active_relay());
}

#[tokio::test]
async fn test_concurrent_conversions_do_not_interleave() {
    let (engine, converter) =
        loaded(ScriptedEngine::new().with_step_delay(Duration::from_millis(5))).await;
    let tasks: Vec<_> = ["mp3", "wav", "flac", "ogg"]
        .into_iter()
        .map(|format| {
            let converter = converter.clone();
            tokio::spawn(async move {
                converter
                    .convert(&asset("audio/wav", "a.wav"), format, None)
                    .await
                    .map(|out| out.media_type())
            })
        })
        .collect();
    for (task, format) in tasks.into_iter().zip(["mp3", "wav", "flac", "ogg"]) {
        assert_eq!(task.await.unwrap().unwrap(), format!("audio/{format}"));
    }

    let journal: Vec<_> = engine
        .journal()
        .into_iter()
        .filter(|op| *op != EngineOp::Load)
        .collect();
    assert_eq!(journal.len(), 16);
    for run in journal.chunks(4) {
        assert!(matches!(&run[0], EngineOp::Write(name) if name == "input.wav"));
        assert!(run[1].is_probe());
        let EngineOp::Exec(args) = &run[2] else {
            panic!("expected transcode, got {:?}", run[2]);
        };
        assert_eq!(run[3], EngineOp::Read(args.last().unwrap().clone()));
    }
}

#[tokio::test]
async fn test_load_once_across_many_callers() {
    let engine = Arc::new(ScriptedEngine::new().with_step_delay(Duration::from_millis(5)));
    let converter = Arc::new(Converter::new(engine.clone()));
    let loads: Vec<_> = (0..4)
        .map(|_| {
            let converter = converter.clone();
            tokio::spawn(async move { converter.load(None).await })
        })
        .collect();
    for load in loads {
        load.await.unwrap().unwrap();
    }
    assert_eq!(engine.load_count(), 1);
}
