//! Mocks and fixtures shared by the Sluice test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

use sluice_core::context::AdapterContext;
use sluice_core::error::{Result, SluiceError};
use sluice_core::pipeline::StepDefinition;
use sluice_core::traits::{Mailer, RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

/// Build a record from a JSON object literal.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture record must be an object, got {other}"),
    }
}

/// `n` records `{"id": 0..n}`.
pub fn numbered(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| record(serde_json::json!({ "id": i })))
        .collect()
}

/// Adapter that remembers every batch it receives and passes it through.
#[derive(Clone)]
pub struct RecordingAdapter {
    kind: StepKind,
    code: String,
    seen: Arc<Mutex<Vec<Vec<Record>>>>,
}

impl RecordingAdapter {
    pub fn new(kind: StepKind, code: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            seen: Arc::default(),
        }
    }

    pub fn batches(&self) -> Vec<Vec<Record>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl StepAdapter for RecordingAdapter {
    fn kind(&self) -> StepKind {
        self.kind
    }

    fn code(&self) -> &str {
        &self.code
    }

    fn description(&self) -> &str {
        "Records its input for assertions"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a AdapterContext,
        _step: &'a StepDefinition,
        input: Vec<Record>,
        _errors: &'a dyn RecordErrorSink,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(input.clone());
            Ok(StepResult::passthrough(input.len()))
        })
    }
}

/// Adapter that tags every record with `field = value`.
pub struct TaggingAdapter {
    kind: StepKind,
    code: String,
    field: String,
    value: Value,
}

impl TaggingAdapter {
    pub fn new(kind: StepKind, code: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
        Self {
            kind,
            code: code.into(),
            field: field.into(),
            value,
        }
    }
}

impl StepAdapter for TaggingAdapter {
    fn kind(&self) -> StepKind {
        self.kind
    }

    fn code(&self) -> &str {
        &self.code
    }

    fn description(&self) -> &str {
        "Sets a fixed field on every record"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a AdapterContext,
        _step: &'a StepDefinition,
        input: Vec<Record>,
        _errors: &'a dyn RecordErrorSink,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            let out = input
                .into_iter()
                .map(|mut r| {
                    r.insert(self.field.clone(), self.value.clone());
                    r
                })
                .collect();
            Ok(StepResult::with_records(out, 0))
        })
    }
}

/// Adapter that rejects records lacking `field`, reporting each one.
pub struct RejectingAdapter {
    kind: StepKind,
    code: String,
    field: String,
}

impl RejectingAdapter {
    pub fn new(kind: StepKind, code: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            field: field.into(),
        }
    }
}

impl StepAdapter for RejectingAdapter {
    fn kind(&self) -> StepKind {
        self.kind
    }

    fn code(&self) -> &str {
        &self.code
    }

    fn description(&self) -> &str {
        "Rejects records missing a field"
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a AdapterContext,
        _step: &'a StepDefinition,
        input: Vec<Record>,
        errors: &'a dyn RecordErrorSink,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            let mut kept = vec![];
            let mut fail = 0;
            for r in input {
                if r.contains_key(&self.field) {
                    kept.push(r);
                } else {
                    errors.on_record_error(&ctx.step_key, &format!("missing {}", self.field), &r, None);
                    fail += 1;
                }
            }
            Ok(StepResult::with_records(kept, fail))
        })
    }
}

/// Adapter that fails the whole step for its first `failures` calls.
pub struct FailingAdapter {
    kind: StepKind,
    code: String,
    failures: usize,
    calls: AtomicUsize,
}

impl FailingAdapter {
    /// Fails every call.
    pub fn always(kind: StepKind, code: impl Into<String>) -> Self {
        Self::times(kind, code, usize::MAX)
    }

    pub fn times(kind: StepKind, code: impl Into<String>, failures: usize) -> Self {
        Self {
            kind,
            code: code.into(),
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

impl StepAdapter for FailingAdapter {
    fn kind(&self) -> StepKind {
        self.kind
    }

    fn code(&self) -> &str {
        &self.code
    }

    fn description(&self) -> &str {
        "Fails the step"
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a AdapterContext,
        _step: &'a StepDefinition,
        input: Vec<Record>,
        _errors: &'a dyn RecordErrorSink,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(SluiceError::adapter(&ctx.step_key, "simulated outage"));
            }
            Ok(StepResult::passthrough(input.len()))
        })
    }
}

/// A message captured by [`RecordingMailer`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Mailer that keeps messages instead of sending them.
#[derive(Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<SentMail>>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, to: &[String], subject: &str, body: &str) -> BoxFuture<'_, Result<()>> {
        let mail = SentMail {
            to: to.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
        };
        Box::pin(async move {
            self.sent.lock().unwrap().push(mail);
            Ok(())
        })
    }
}

/// Write `content` to a fresh temp file with the given suffix.
pub fn temp_file(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    use std::io::Write;
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}
