use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;

use super::{check_file_name, Engine, EngineError, EngineEvent, EventSink, ExecOutput};

/// One call made against a [`ScriptedEngine`].
#[derive(Clone, Debug, PartialEq)]
pub enum EngineOp {
    Load,
    Write(String),
    Exec(Vec<String>),
    Read(String),
}

impl EngineOp {
    pub fn is_probe(&self) -> bool {
        matches!(self, EngineOp::Exec(args) if args.len() == 2 && args[0] == "-i")
    }
}

#[derive(Default)]
struct Script {
    probe_text: String,
    probe_succeeds: bool,
    load_failures: usize,
    exec_error: Option<String>,
    progress: Vec<f64>,
    step_delay: Duration,
}

/// In-memory engine that journals every call. A conversion command copies
/// its input file to the output name given as the last argument.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Script,
    loads: AtomicUsize,
    journal: Mutex<Vec<EngineOp>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text printed by the probe. The probe fails, like ffmpeg without an
    /// output file, unless [`Self::probe_succeeds`] is set.
    pub fn with_probe_text(mut self, text: impl Into<String>) -> Self {
        self.script.probe_text = text.into();
        self
    }

    pub fn probe_succeeds(mut self) -> Self {
        self.script.probe_succeeds = true;
        self
    }

    /// The first `n` loads fail.
    pub fn with_load_failures(mut self, n: usize) -> Self {
        self.script.load_failures = n;
        self
    }

    /// Conversion commands fail with this diagnostic.
    pub fn with_exec_error(mut self, diagnostic: impl Into<String>) -> Self {
        self.script.exec_error = Some(diagnostic.into());
        self
    }

    /// Progress ratios reported by each conversion command.
    pub fn with_progress(mut self, ratios: Vec<f64>) -> Self {
        self.script.progress = ratios;
        self
    }

    /// Sleep before every file operation and command.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.script.step_delay = delay;
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn journal(&self) -> Vec<EngineOp> {
        lock(&self.journal).clone()
    }

    /// Number of calls other than `load`.
    pub fn call_count(&self) -> usize {
        lock(&self.journal)
            .iter()
            .filter(|op| **op != EngineOp::Load)
            .count()
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(name).cloned()
    }

    fn record(&self, op: EngineOp) {
        lock(&self.journal).push(op);
    }

    fn emit(&self, event: EngineEvent) {
        let sink = lock(&self.sink).clone();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    async fn pause(&self) {
        if !self.script.step_delay.is_zero() {
            tokio::time::sleep(self.script.step_delay).await;
        }
    }

    fn probe(&self) -> Result<ExecOutput, EngineError> {
        for line in self.script.probe_text.lines() {
            self.emit(EngineEvent::Log(line.to_string()));
        }
        if self.script.probe_succeeds {
            return Ok(ExecOutput {
                log: self.script.probe_text.clone(),
            });
        }
        Err(EngineError::Exec {
            code: Some(1),
            diagnostic: format!(
                "{}\nAt least one output file must be specified",
                self.script.probe_text
            ),
        })
    }

    fn transcode(&self, args: &[String]) -> Result<ExecOutput, EngineError> {
        if let Some(diagnostic) = &self.script.exec_error {
            self.emit(EngineEvent::Log(diagnostic.clone()));
            return Err(EngineError::Exec {
                code: Some(1),
                diagnostic: diagnostic.clone(),
            });
        }
        let input = args
            .windows(2)
            .find(|w| w[0] == "-i")
            .map(|w| w[1].clone())
            .ok_or_else(|| EngineError::Exec {
                code: Some(1),
                diagnostic: "no input".to_string(),
            })?;
        let output = args.last().cloned().unwrap_or_default();
        check_file_name(&output)?;
        let data = lock(&self.files)
            .get(&input)
            .cloned()
            .ok_or_else(|| EngineError::Exec {
                code: Some(1),
                diagnostic: format!("{input}: No such file or directory"),
            })?;
        for ratio in &self.script.progress {
            self.emit(EngineEvent::Progress(*ratio));
        }
        lock(&self.files).insert(output, data);
        Ok(ExecOutput::default())
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn load(&self, sink: Arc<dyn EventSink>) -> Result<(), EngineError> {
        self.record(EngineOp::Load);
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if attempt < self.script.load_failures {
            return Err(EngineError::Resource("core resource: fetch failed".to_string()));
        }
        sink.emit(EngineEvent::Log("engine ready".to_string()));
        *lock(&self.sink) = Some(sink);
        Ok(())
    }

    async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        self.record(EngineOp::Write(name.to_string()));
        self.pause().await;
        check_file_name(name)?;
        lock(&self.files).insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn exec(&self, args: &[String]) -> Result<ExecOutput, EngineError> {
        let op = EngineOp::Exec(args.to_vec());
        let probe = op.is_probe();
        self.record(op);
        self.pause().await;
        if probe {
            self.probe()
        } else {
            self.transcode(args)
        }
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        self.record(EngineOp::Read(name.to_string()));
        self.pause().await;
        lock(&self.files)
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::File {
                name: name.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }
}
