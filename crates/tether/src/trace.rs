//! Binary trace annotations emitted while binding a request.

use std::sync::Arc;

use tether_name::{BoundName, Dtab, NameFault, Path};

/// Annotation key for the logical path being bound.
pub const NAMER_PATH: &str = "namer.path";
/// Annotation key for the printed base delegation table.
pub const NAMER_DTAB_BASE: &str = "namer.dtab.base";
/// Annotation key for the bound name's rendered identity.
pub const NAMER_NAME: &str = "namer.name";
/// Annotation key for a binding failure's kind identifier.
pub const NAMER_FAILURE: &str = "namer.failure";

/// Records binary (key/value) annotations for an acquisition.
pub trait TraceRecorder: Send + Sync {
    fn record_binary(&self, key: &str, value: String);
}

/// A recorder from a closure.
pub struct FnRecorder<F> {
    f: F,
}

/// Lifts a closure into a [`TraceRecorder`].
pub fn recorder<F>(f: F) -> FnRecorder<F>
where
    F: Fn(&str, String) + Send + Sync,
{
    FnRecorder { f }
}

impl<F> TraceRecorder for FnRecorder<F>
where
    F: Fn(&str, String) + Send + Sync,
{
    fn record_binary(&self, key: &str, value: String) {
        (self.f)(key, value)
    }
}

/// The set of recorders a binding stack annotates.
///
/// A panicking recorder is caught and ignored; user tracing must never
/// take down the data path.
#[derive(Clone, Default)]
pub struct NamerTracing {
    recorders: Vec<Arc<dyn TraceRecorder>>,
}

impl NamerTracing {
    pub fn new() -> NamerTracing {
        NamerTracing::default()
    }

    pub fn with_recorder<R>(mut self, recorder: R) -> NamerTracing
    where
        R: TraceRecorder + 'static,
    {
        self.recorders.push(Arc::new(recorder));
        self
    }

    fn record(&self, key: &str, value: String) {
        for recorder in &self.recorders {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                recorder.record_binary(key, value.clone());
            }));
        }
    }

    pub fn record_path(&self, path: &Path) {
        self.record(NAMER_PATH, path.to_string());
    }

    pub fn record_base_dtab(&self, dtab: &Dtab) {
        self.record(NAMER_DTAB_BASE, dtab.to_string());
    }

    pub fn record_name(&self, name: &BoundName) {
        self.record(NAMER_NAME, name.render());
    }

    pub fn record_naming_failure(&self, fault: &NameFault) {
        self.record(NAMER_FAILURE, fault.kind_label().to_string());
    }
}
