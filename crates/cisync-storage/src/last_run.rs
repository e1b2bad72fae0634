use std::sync::Arc;

use chrono::Utc;

use crate::store::{LastRunMap, WatermarkMeta, WatermarkRecord, WatermarkStore};
use crate::StoreError;

/// In-memory view of one provider's watermarks, flushed with [`LastRunStore::save`].
pub struct LastRunStore {
    store: Arc<dyn WatermarkStore>,
    records: LastRunMap,
}

impl LastRunStore {
    pub async fn init(store: Arc<dyn WatermarkStore>) -> Result<Self, StoreError> {
        let records = store.read().await?;
        Ok(Self { store, records })
    }

    pub fn get_last_run(&self, entity: &str) -> Option<u64> {
        self.records.get(entity).map(|r| r.last_run)
    }

    pub fn get_record(&self, entity: &str) -> Option<&WatermarkRecord> {
        self.records.get(entity)
    }

    /// Advances the watermark; returns false and leaves it untouched unless
    /// `candidate` is greater than the stored value.
    pub fn set_last_run(&mut self, entity: &str, candidate: u64) -> bool {
        if let Some(record) = self.records.get_mut(entity) {
            if candidate <= record.last_run {
                return false;
            }
            record.last_run = candidate;
            record.updated_at = Utc::now();
            return true;
        }
        self.records.insert(
            entity.to_string(),
            WatermarkRecord {
                last_run: candidate,
                updated_at: Utc::now(),
                meta: None,
            },
        );
        true
    }

    /// Drops the watermark back to 0; only legacy-metadata migration calls this.
    pub fn reset_last_run(&mut self, entity: &str) {
        let record = self.entry(entity);
        record.last_run = 0;
        record.updated_at = Utc::now();
    }

    pub fn get_meta(&self, entity: &str) -> Option<WatermarkMeta> {
        self.records.get(entity).and_then(|r| r.meta)
    }

    pub fn set_meta(&mut self, entity: &str, meta: WatermarkMeta) {
        let record = self.entry(entity);
        record.meta = Some(meta);
        record.updated_at = Utc::now();
    }

    pub fn records(&self) -> &LastRunMap {
        &self.records
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    pub async fn save(&mut self) -> Result<(), StoreError> {
        let persisted = self.store.write(&self.records).await?;
        if !persisted.is_empty() {
            self.records = persisted;
        }
        Ok(())
    }

    fn entry(&mut self, entity: &str) -> &mut WatermarkRecord {
        self.records
            .entry(entity.to_string())
            .or_insert_with(|| WatermarkRecord {
                last_run: 0,
                updated_at: Utc::now(),
                meta: None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStore, NullStore};
    use tempfile::tempdir;

    async fn empty_store() -> LastRunStore {
        LastRunStore::init(Arc::new(NullStore)).await.unwrap()
    }

    #[tokio::test]
    async fn watermark_only_moves_forward() {
        let mut store = empty_store().await;
        assert_eq!(store.get_last_run("org/repo"), None);

        assert!(store.set_last_run("org/repo", 10));
        assert!(!store.set_last_run("org/repo", 7));
        assert!(!store.set_last_run("org/repo", 10));
        assert_eq!(store.get_last_run("org/repo"), Some(10));

        assert!(store.set_last_run("org/repo", 11));
        assert_eq!(store.get_last_run("org/repo"), Some(11));
    }

    #[tokio::test]
    async fn meta_and_reset_keep_each_other() {
        let mut store = empty_store().await;
        store.set_last_run("org/repo", 900);
        store.set_meta("org/repo", WatermarkMeta { version: 2 });
        store.reset_last_run("org/repo");

        assert_eq!(store.get_last_run("org/repo"), Some(0));
        assert_eq!(store.get_meta("org/repo"), Some(WatermarkMeta { version: 2 }));
    }

    #[tokio::test]
    async fn save_round_trips_through_local_file() {
        let dir = tempdir().expect("tempdir");
        let backing: Arc<dyn WatermarkStore> = Arc::new(LocalStore::new(dir.path().join("w.json")));

        let mut first = LastRunStore::init(backing.clone()).await.unwrap();
        first.set_last_run("job-a", 3);
        first.save().await.unwrap();

        let second = LastRunStore::init(backing).await.unwrap();
        assert_eq!(second.get_last_run("job-a"), Some(3));
    }

    #[tokio::test]
    async fn dry_run_save_keeps_memory_state() {
        let mut store = empty_store().await;
        store.set_last_run("e", 4);
        store.save().await.unwrap();
        assert_eq!(store.get_last_run("e"), Some(4));
    }
}
