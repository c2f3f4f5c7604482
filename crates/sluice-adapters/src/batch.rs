use std::future::Future;

use tracing::{debug, warn};

use sluice_core::circuit::CircuitKey;
use sluice_core::context::AdapterContext;
use sluice_core::error::Result;
use sluice_core::traits::RecordErrorSink;
use sluice_core::types::Record;

/// Totals of a chunked delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub ok: usize,
    pub fail: usize,
    /// Positions in the delivered slice of the records that failed, ascending.
    pub failed: Vec<usize>,
}

impl DeliveryReport {
    /// Keep the entries of `batch` whose records were delivered.
    pub fn delivered<T>(&self, batch: Vec<T>) -> Vec<T> {
        batch
            .into_iter()
            .enumerate()
            .filter(|(i, _)| self.failed.binary_search(i).is_err())
            .map(|(_, item)| item)
            .collect()
    }
}

/// Send `records` in sequential chunks of `batch_size`.
///
/// Each chunk goes through the retry policy and the circuit breaker on its
/// own. A chunk that still fails reports every one of its records to
/// `errors` and delivery continues with the next chunk.
pub async fn deliver_in_chunks<F, Fut>(
    ctx: &AdapterContext,
    circuit: &CircuitKey,
    records: &[Record],
    batch_size: usize,
    errors: &dyn RecordErrorSink,
    mut send: F,
) -> DeliveryReport
where
    F: FnMut(Vec<Record>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let size = batch_size.max(1);
    let mut report = DeliveryReport::default();
    for (index, chunk) in records.chunks(size).enumerate() {
        let result = ctx.guarded_call(circuit, |_| send(chunk.to_vec())).await;
        match result {
            Ok(()) => {
                debug!(step_key = %ctx.step_key, chunk = index, size = chunk.len(), "Chunk delivered");
                report.ok += chunk.len();
            }
            Err(e) => {
                warn!(
                    step_key = %ctx.step_key,
                    chunk = index,
                    size = chunk.len(),
                    error = %e,
                    "Chunk delivery failed"
                );
                let message = e.to_string();
                for record in chunk {
                    errors.on_record_error(&ctx.step_key, &message, record, None);
                }
                report.fail += chunk.len();
                report.failed.extend(index * size..index * size + chunk.len());
            }
        }
    }
    report
}
