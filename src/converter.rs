use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tokio::time::timeout;
use tokio_retry::Retry;
use tracing::instrument;

use crate::{
    asset::{InputAsset, OutputAsset},
    directive,
    engine::{Engine, EngineError, EventSink},
    format::{input_file_name, output_file_name, TargetFormat, UnsupportedFormat},
    inspect,
    relay::{ConversionObserver, RelayHub},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Unloaded,
    Loading,
    Ready,
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("engine load failed: {0}")]
    EngineLoad(#[source] EngineError),
    #[error("engine is not loaded")]
    EngineNotLoaded,
    #[error("conversion failed: {0}")]
    Conversion(#[source] EngineError),
    #[error("conversion timed out after {0:?}")]
    Timeout(Duration),
}

impl From<UnsupportedFormat> for ConvertError {
    fn from(err: UnsupportedFormat) -> Self {
        ConvertError::UnsupportedFormat(err.0)
    }
}

/// Drives a shared engine: loads it once and runs conversions one at a time.
///
/// `convert` does not load the engine on demand; callers load first and get
/// [`ConvertError::EngineNotLoaded`] otherwise.
///
/// The timeout abandons the running step. Whether the engine stops depends on
/// the engine: [`crate::engine::FfmpegProcess`] kills its child process, other
/// engines may keep working in the background.
pub struct Converter {
    engine: Arc<dyn Engine>,
    relays: Arc<RelayHub>,
    state: Mutex<EngineState>,
    load_lock: tokio::sync::Mutex<()>,
    convert_lock: tokio::sync::Mutex<()>,
    timeout: Duration,
}

impl Converter {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self::with_timeout(engine, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(engine: Arc<dyn Engine>, timeout: Duration) -> Self {
        tracing::info!(?timeout, "new converter");
        Self {
            engine,
            relays: Arc::new(RelayHub::new()),
            state: Mutex::new(EngineState::Unloaded),
            load_lock: tokio::sync::Mutex::new(()),
            convert_lock: tokio::sync::Mutex::new(()),
            timeout,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: EngineState) {
        tracing::debug!(?state, "engine state");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// True while a conversion observer is registered with the engine.
    pub fn has_active_relay(&self) -> bool {
        self.relays.is_registered()
    }

    /// Loads the engine. Does nothing once the engine is ready; concurrent
    /// callers wait for a single load. `on_log` keeps receiving engine log
    /// lines for the lifetime of the engine.
    #[instrument(skip_all)]
    pub async fn load(
        &self,
        on_log: Option<Arc<dyn ConversionObserver>>,
    ) -> Result<(), ConvertError> {
        if self.state() == EngineState::Ready {
            return Ok(());
        }
        let _loading = self.load_lock.lock().await;
        if self.state() == EngineState::Ready {
            return Ok(());
        }

        self.set_state(EngineState::Loading);
        self.relays.set_engine_log(on_log);
        let sink: Arc<dyn EventSink> = self.relays.clone();
        match self.engine.load(sink).await {
            Ok(()) => {
                self.set_state(EngineState::Ready);
                tracing::info!("engine loaded");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "engine load");
                self.relays.set_engine_log(None);
                self.set_state(EngineState::Unloaded);
                Err(ConvertError::EngineLoad(e))
            }
        }
    }

    /// Calls [`Self::load`] until it succeeds, sleeping between attempts as
    /// `strategy` says. Returns the last error once `strategy` runs out.
    pub async fn load_retrying<I>(
        &self,
        strategy: I,
        on_log: Option<Arc<dyn ConversionObserver>>,
    ) -> Result<(), ConvertError>
    where
        I: IntoIterator<Item = Duration>,
    {
        Retry::spawn(strategy, || {
            let on_log = on_log.clone();
            async move { self.load(on_log).await }
        })
        .await
    }

    /// Converts `input` to the format named by `format`. Calls are queued;
    /// only one conversion touches the engine at a time.
    #[instrument(skip(self, input, observer), fields(len = input.data().len(), media_type = input.media_type()))]
    pub async fn convert(
        &self,
        input: &InputAsset,
        format: &str,
        observer: Option<Arc<dyn ConversionObserver>>,
    ) -> Result<OutputAsset, ConvertError> {
        let format: TargetFormat = format.parse()?;
        if self.state() != EngineState::Ready {
            return Err(ConvertError::EngineNotLoaded);
        }

        let _serial = self.convert_lock.lock().await;
        let _relay = self.relays.register(observer);

        match timeout(self.timeout, self.run(input, format)).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "conversion abandoned");
                Err(ConvertError::Timeout(self.timeout))
            }
        }
    }

    async fn run(&self, input: &InputAsset, format: TargetFormat) -> Result<OutputAsset, ConvertError> {
        let input_name = input_file_name(input.media_type());
        tracing::debug!(file = input_name, "writing input");
        self.engine
            .write_file(&input_name, input.data())
            .await
            .map_err(ConvertError::Conversion)?;

        let has_secondary = inspect::has_secondary_stream(self.engine.as_ref(), &input_name).await;
        let args = directive::build(format, &input_name, has_secondary);
        tracing::info!(%format, has_secondary, args = args.join(" "), "transcoding");
        self.engine
            .exec(&args)
            .await
            .map_err(ConvertError::Conversion)?;

        let data = self
            .engine
            .read_file(&output_file_name(format.as_str()))
            .await
            .map_err(ConvertError::Conversion)?;
        tracing::info!(len = data.len(), "converted");
        Ok(OutputAsset::new(data, format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineOp, ScriptedEngine};

    fn converter(engine: ScriptedEngine) -> (Arc<ScriptedEngine>, Converter) {
        let engine = Arc::new(engine);
        (engine.clone(), Converter::new(engine))
    }

    fn mp3() -> InputAsset {
        InputAsset::new(b"ID3 audio".to_vec(), "audio/mpeg", Some("song.mp3".to_string()))
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let (engine, converter) = converter(ScriptedEngine::new());
        assert_eq!(converter.state(), EngineState::Unloaded);
        converter.load(None).await.unwrap();
        converter.load(None).await.unwrap();
        assert_eq!(engine.load_count(), 1);
        assert_eq!(converter.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one() {
        let (engine, converter) =
            converter(ScriptedEngine::new().with_step_delay(Duration::from_millis(20)));
        let (a, b) = tokio::join!(converter.load(None), converter.load(None));
        a.unwrap();
        b.unwrap();
        assert_eq!(engine.load_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_can_be_retried() {
        let (engine, converter) = converter(ScriptedEngine::new().with_load_failures(1));
        let err = converter.load(None).await.unwrap_err();
        assert!(matches!(err, ConvertError::EngineLoad(EngineError::Resource(_))));
        assert_eq!(converter.state(), EngineState::Unloaded);
        converter.load(None).await.unwrap();
        assert_eq!(converter.state(), EngineState::Ready);
        assert_eq!(engine.load_count(), 2);
    }

    #[tokio::test]
    async fn test_load_log_observer() {
        let (_engine, converter) = converter(ScriptedEngine::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        converter.load(Some(Arc::new(tx))).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(crate::relay::ConversionEvent::Log("engine ready".to_string()))
        );
    }

    #[tokio::test]
    async fn test_not_loaded() {
        let (engine, converter) = converter(ScriptedEngine::new());
        let err = converter.convert(&mp3(), "wav", None).await.unwrap_err();
        assert!(matches!(err, ConvertError::EngineNotLoaded));
        assert_eq!(engine.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_format_before_engine() {
        let (engine, converter) = converter(ScriptedEngine::new());
        converter.load(None).await.unwrap();
        let err = converter.convert(&mp3(), "xyz", None).await.unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedFormat(ref f) if f == "xyz"));
        assert_eq!(engine.call_count(), 0);
    }

    #[tokio::test]
    async fn test_convert_sequence() {
        let (engine, converter) = converter(ScriptedEngine::new());
        converter.load(None).await.unwrap();
        let out = converter.convert(&mp3(), "wav", None).await.unwrap();
        assert_eq!(out.media_type(), "audio/wav");
        assert_eq!(out.data(), b"ID3 audio");

        let journal = engine.journal();
        assert_eq!(journal.len(), 5);
        assert_eq!(journal[1], EngineOp::Write("input.mp3".to_string()));
        assert!(journal[2].is_probe());
        assert_eq!(
            journal[3],
            EngineOp::Exec(directive::build(TargetFormat::Wav, "input.mp3", false))
        );
        assert_eq!(journal[4], EngineOp::Read("output.wav".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_media_type_has_no_extension() {
        let (engine, converter) = converter(ScriptedEngine::new());
        converter.load(None).await.unwrap();
        let input = InputAsset::new(vec![1, 2, 3], "application/octet-stream", None);
        converter.convert(&input, "ogg", None).await.unwrap();
        assert_eq!(engine.journal()[1], EngineOp::Write("input".to_string()));
    }

    #[tokio::test]
    async fn test_failure_wraps_diagnostic_and_releases_relay() {
        let (_engine, converter) =
            converter(ScriptedEngine::new().with_exec_error("Unknown encoder 'libmp3lame'"));
        converter.load(None).await.unwrap();
        let observer: Arc<dyn ConversionObserver> = Arc::new(|_e: crate::relay::ConversionEvent| {});
        let err = converter
            .convert(&mp3(), "mp3", Some(observer))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Conversion(_)));
        assert!(err.to_string().contains("Unknown encoder 'libmp3lame'"));
        assert!(!converter.has_active_relay());
    }

    #[tokio::test]
    async fn test_timeout() {
        let (_engine, converter) = {
            let engine = Arc::new(ScriptedEngine::new().with_step_delay(Duration::from_millis(200)));
            let converter = Converter::with_timeout(engine.clone(), Duration::from_millis(50));
            (engine, converter)
        };
        converter.load(None).await.unwrap();
        let err = converter.convert(&mp3(), "flac", None).await.unwrap_err();
        assert!(matches!(err, ConvertError::Timeout(_)));
        assert!(!converter.has_active_relay());
    }

    #[tokio::test]
    async fn test_load_retrying_until_ready() {
        let (engine, converter) = converter(ScriptedEngine::new().with_load_failures(2));
        let strategy = tokio_retry::strategy::FixedInterval::from_millis(1).take(5);
        converter.load_retrying(strategy, None).await.unwrap();
        assert_eq!(converter.state(), EngineState::Ready);
        assert_eq!(engine.load_count(), 3);
    }

    #[tokio::test]
    async fn test_load_retrying_gives_up() {
        let (engine, converter) = converter(ScriptedEngine::new().with_load_failures(10));
        let strategy = tokio_retry::strategy::FixedInterval::from_millis(1).take(2);
        let err = converter.load_retrying(strategy, None).await.unwrap_err();
        assert!(matches!(err, ConvertError::EngineLoad(_)));
        assert_eq!(converter.state(), EngineState::Unloaded);
        assert_eq!(engine.load_count(), 3);
    }
}
