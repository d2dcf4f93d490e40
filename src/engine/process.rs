use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, OnceLock},
};

use async_tempfile::TempDir;
use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};

use super::{
    check_file_name,
    progress::{ParsedLine, ProgressParser},
    Engine, EngineError, EngineEvent, EventSink, ExecOutput,
};
use crate::format::TargetFormat;

/// Stream listings and `Duration:` lines are printed at `info`; the probe
/// and progress parsing need them, so the level is not configurable.
const FIXED_ARGS: [&str; 8] = [
    "-hide_banner",
    "-nostdin",
    "-y",
    "-progress",
    "pipe:2",
    "-nostats",
    "-loglevel",
    "info",
];

#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub ffmpeg_path: PathBuf,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

struct Loaded {
    workdir: TempDir,
    sink: Arc<dyn EventSink>,
}

/// Engine backed by the ffmpeg executable. Files live in a private
/// temporary directory created on load and removed with the engine.
pub struct FfmpegProcess {
    config: ProcessConfig,
    loaded: OnceLock<Loaded>,
}

impl FfmpegProcess {
    pub fn new(config: ProcessConfig) -> Self {
        tracing::debug!(path = ?config.ffmpeg_path, "Initializing ffmpeg process engine");
        Self {
            config,
            loaded: OnceLock::new(),
        }
    }

    fn loaded(&self) -> Result<&Loaded, EngineError> {
        self.loaded.get().ok_or(EngineError::NotLoaded)
    }

    fn path_of(&self, name: &str) -> Result<PathBuf, EngineError> {
        check_file_name(name)?;
        let workdir: &Path = &self.loaded()?.workdir;
        Ok(workdir.join(name))
    }

    async fn run_info(&self, arg: &str) -> Result<String, EngineError> {
        let output = Command::new(&self.config.ffmpeg_path)
            .args(["-hide_banner", arg])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                EngineError::Resource(format!(
                    "can't run {}: {e}",
                    self.config.ffmpeg_path.display()
                ))
            })?;
        if !output.status.success() {
            return Err(EngineError::Resource(format!(
                "{} {arg} exited with {:?}",
                self.config.ffmpeg_path.display(),
                output.status.code()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Engine for FfmpegProcess {
    #[tracing::instrument(skip_all)]
    async fn load(&self, sink: Arc<dyn EventSink>) -> Result<(), EngineError> {
        if self.loaded.get().is_some() {
            return Ok(());
        }
        let version = self.run_info("-version").await?;
        let version = version.lines().next().unwrap_or_default().to_string();
        tracing::info!(version, "ffmpeg found");
        sink.emit(EngineEvent::Log(version));

        let encoders = self.run_info("-encoders").await?;
        for format in TargetFormat::ALL {
            if !has_encoder(&encoders, format.codec()) {
                tracing::warn!(%format, codec = format.codec(), "encoder not available");
                sink.emit(EngineEvent::Log(format!(
                    "encoder {} for {format} is not available",
                    format.codec()
                )));
            }
        }

        let workdir = TempDir::new()
            .await
            .map_err(|e| EngineError::Resource(format!("can't create work dir: {e}")))?;
        tracing::debug!(dir = ?workdir.to_path_buf(), "work dir");

        if self.loaded.set(Loaded { workdir, sink }).is_err() {
            tracing::debug!("engine loaded concurrently");
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, data), fields(len = data.len()))]
    async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        let path = self.path_of(name)?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|source| EngineError::File {
                name: name.to_string(),
                source,
            })
    }

    #[tracing::instrument(skip(self))]
    async fn exec(&self, args: &[String]) -> Result<ExecOutput, EngineError> {
        let loaded = self.loaded()?;
        let workdir: &Path = &loaded.workdir;

        let mut child = Command::new(&self.config.ffmpeg_path)
            .current_dir(workdir)
            .args(FIXED_ARGS)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Resource("no stderr pipe".to_string()))?;
        // stderr may carry tag bytes in any encoding
        let mut lines = BufReader::new(stderr).split(b'\n');
        let mut parser = ProgressParser::new();
        let mut log = String::new();

        while let Some(raw) = lines.next_segment().await? {
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches('\r').to_string();
            match parser.parse(&line) {
                ParsedLine::Log => {
                    log.push_str(&line);
                    log.push('\n');
                    loaded.sink.emit(EngineEvent::Log(line));
                }
                ParsedLine::Progress(ratio) => loaded.sink.emit(EngineEvent::Progress(ratio)),
                ParsedLine::Ignored => {}
            }
        }

        let status = child.wait().await?;
        tracing::debug!(code = status.code(), "ffmpeg done");
        if !status.success() {
            return Err(EngineError::Exec {
                code: status.code(),
                diagnostic: log,
            });
        }
        Ok(ExecOutput { log })
    }

    #[tracing::instrument(skip(self))]
    async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.path_of(name)?;
        tokio::fs::read(&path)
            .await
            .map_err(|source| EngineError::File {
                name: name.to_string(),
                source,
            })
    }
}

/// Looks for `codec` in the name column of `ffmpeg -encoders` output.
fn has_encoder(listing: &str, codec: &str) -> bool {
    listing
        .lines()
        .filter_map(|l| l.split_whitespace().nth(1))
        .any(|name| name == codec)
}
