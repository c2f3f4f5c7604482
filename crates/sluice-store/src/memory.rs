use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use sluice_core::checkpoint::CheckpointMap;
use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::{CheckpointStore, RunStore};
use sluice_core::types::{DeadLetter, RunId, RunRecord, RunStatus};

#[derive(Default)]
struct Tables {
    runs: HashMap<String, (u64, RunRecord)>,
    next_seq: u64,
    checkpoints: HashMap<String, CheckpointMap>,
    dead_letters: HashMap<String, Vec<DeadLetter>>,
}

/// Process-local store for tests and dry runs. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.inner
            .lock()
            .map_err(|e| SluiceError::Database(e.to_string()))
    }
}

impl CheckpointStore for MemoryStore {
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<CheckpointMap>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            Ok(self
                .tables()?
                .checkpoints
                .get(&run_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn save(&self, run_id: &RunId, entries: &CheckpointMap) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.0.clone();
        let entries = entries.clone();
        Box::pin(async move {
            self.tables()?.checkpoints.insert(run_id, entries);
            Ok(())
        })
    }
}

impl RunStore for MemoryStore {
    fn save_run(&self, run: &RunRecord) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let mut tables = self.tables()?;
            let seq = match tables.runs.get(&run.id.0) {
                Some((seq, _)) => *seq,
                None => {
                    tables.next_seq += 1;
                    tables.next_seq
                }
            };
            tables.runs.insert(run.id.0.clone(), (seq, run));
            Ok(())
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            Ok(self.tables()?.runs.get(&run_id).map(|(_, r)| r.clone()))
        })
    }

    fn list_runs(&self, status: Option<RunStatus>) -> BoxFuture<'_, Result<Vec<RunRecord>>> {
        Box::pin(async move {
            let tables = self.tables()?;
            let mut runs: Vec<_> = tables
                .runs
                .values()
                .filter(|(_, r)| status.map_or(true, |s| r.status == s))
                .cloned()
                .collect();
            runs.sort_by(|(sa, a), (sb, b)| b.started_at.cmp(&a.started_at).then(sb.cmp(sa)));
            Ok(runs.into_iter().map(|(_, r)| r).collect())
        })
    }

    fn append_dead_letters(&self, letters: &[DeadLetter]) -> BoxFuture<'_, Result<usize>> {
        let letters = letters.to_vec();
        Box::pin(async move {
            let mut tables = self.tables()?;
            let n = letters.len();
            for letter in letters {
                tables
                    .dead_letters
                    .entry(letter.run_id.0.clone())
                    .or_default()
                    .push(letter);
            }
            Ok(n)
        })
    }

    fn dead_letters(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<DeadLetter>>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            Ok(self
                .tables()?
                .dead_letters
                .get(&run_id)
                .cloned()
                .unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::pipeline::{PipelineDefinition, StepDefinition};
    use sluice_core::types::StepKind;

    fn run() -> RunRecord {
        let def = PipelineDefinition::new("p")
            .with_step(StepDefinition::new("pull", StepKind::Extract, "inline"));
        RunRecord::new(def, vec![])
    }

    #[tokio::test]
    async fn newest_run_listed_first() {
        let store = MemoryStore::new();
        let mut a = run();
        let b = run();
        a.started_at = b.started_at;
        store.save_run(&a).await.unwrap();
        store.save_run(&b).await.unwrap();
        // Re-saving keeps the original insertion position
        a.transition(RunStatus::Failed);
        store.save_run(&a).await.unwrap();

        let ids: Vec<_> = store
            .list_runs(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![b.id.clone(), a.id.clone()]);
        let failed = store.list_runs(Some(RunStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_is_replaced_whole() {
        let store = MemoryStore::new();
        let id = RunId::from_string("r");
        let mut map = CheckpointMap::new();
        map.insert("a".into(), json!(1));
        store.save(&id, &map).await.unwrap();
        store.save(&id, &CheckpointMap::new()).await.unwrap();
        assert!(store.load(&id).await.unwrap().is_empty());
    }
}
