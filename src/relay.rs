use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::engine::{EngineEvent, EventSink};

/// Event delivered to a caller while its conversion runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConversionEvent {
    /// Percent done, 0..=100, never decreasing within one conversion.
    Progress(u8),
    Log(String),
}

pub trait ConversionObserver: Send + Sync {
    fn on_event(&self, event: ConversionEvent);
}

impl<F> ConversionObserver for F
where
    F: Fn(ConversionEvent) + Send + Sync,
{
    fn on_event(&self, event: ConversionEvent) {
        self(event)
    }
}

impl ConversionObserver for mpsc::UnboundedSender<ConversionEvent> {
    fn on_event(&self, event: ConversionEvent) {
        if self.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}

struct Registration {
    id: u64,
    observer: Option<Arc<dyn ConversionObserver>>,
    last_percent: Option<u8>,
}

#[derive(Default)]
struct Relays {
    engine_log: Option<Arc<dyn ConversionObserver>>,
    active: Option<Registration>,
    next_id: u64,
}

/// Routes engine events to the engine log observer set at load time and to
/// the observer of the conversion currently running.
#[derive(Default)]
pub struct RelayHub {
    relays: Mutex<Relays>,
}

/// Keeps a per-conversion observer registered. Dropping it removes the
/// registration.
#[must_use]
pub struct RelayGuard {
    hub: Arc<RelayHub>,
    id: u64,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn relays(&self) -> MutexGuard<'_, Relays> {
        self.relays.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_engine_log(&self, observer: Option<Arc<dyn ConversionObserver>>) {
        self.relays().engine_log = observer;
    }

    /// Registers the observer of a new conversion, replacing any previous
    /// registration.
    pub fn register(self: &Arc<Self>, observer: Option<Arc<dyn ConversionObserver>>) -> RelayGuard {
        let mut relays = self.relays();
        relays.next_id += 1;
        let id = relays.next_id;
        if relays.active.is_some() {
            tracing::warn!("replacing a live relay registration");
        }
        relays.active = Some(Registration {
            id,
            observer,
            last_percent: None,
        });
        RelayGuard {
            hub: Arc::clone(self),
            id,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.relays().active.is_some()
    }

    fn release(&self, id: u64) {
        let mut relays = self.relays();
        if relays.active.as_ref().is_some_and(|r| r.id == id) {
            relays.active = None;
        }
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.hub.release(self.id);
    }
}

fn to_percent(ratio: f64) -> u8 {
    if ratio.is_nan() {
        return 0;
    }
    (ratio * 100.0).round().clamp(0.0, 100.0) as u8
}

impl EventSink for RelayHub {
    fn emit(&self, event: EngineEvent) {
        // observers are called outside the lock
        let (targets, event) = {
            let mut relays = self.relays();
            match event {
                EngineEvent::Log(line) => {
                    let mut targets = Vec::with_capacity(2);
                    targets.extend(relays.engine_log.clone());
                    targets.extend(relays.active.as_ref().and_then(|r| r.observer.clone()));
                    (targets, ConversionEvent::Log(line))
                }
                EngineEvent::Progress(ratio) => {
                    let Some(active) = relays.active.as_mut() else {
                        return;
                    };
                    let percent = to_percent(ratio);
                    if active.last_percent.is_some_and(|last| percent < last) {
                        return;
                    }
                    active.last_percent = Some(percent);
                    (
                        active.observer.clone().into_iter().collect(),
                        ConversionEvent::Progress(percent),
                    )
                }
            }
        };
        for target in targets {
            target.on_event(event.clone());
        }
    }
}
