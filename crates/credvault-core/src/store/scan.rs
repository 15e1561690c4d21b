use std::collections::VecDeque;

use crate::error::Result;
use crate::types::{CredentialRecord, Generation};

use super::queries::CredentialStore;

/// Keyset-paginated walk over the records of one key generation.
///
/// Pages are fetched in id order, `batch_size` rows at a time, so memory
/// stays bounded and the store lock is only held per page. Rows that leave
/// the generation while the scan is running are simply not seen again; the
/// scan always terminates. `resume_after` restarts from a saved cursor.
pub struct GenerationScan<'a> {
    store: &'a CredentialStore,
    generation: Generation,
    batch_size: usize,
    page_after: Option<String>,
    last_yielded: Option<String>,
    buffer: VecDeque<CredentialRecord>,
    exhausted: bool,
}

impl<'a> GenerationScan<'a> {
    pub(crate) fn new(store: &'a CredentialStore, generation: Generation, batch_size: usize) -> Self {
        Self {
            store,
            generation,
            batch_size: batch_size.max(1),
            page_after: None,
            last_yielded: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Skip every record with id <= `id`.
    pub fn resume_after(mut self, id: &str) -> Self {
        self.page_after = Some(id.to_string());
        self.last_yielded = Some(id.to_string());
        self
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Id of the last record handed out; persist it to resume later.
    pub fn cursor(&self) -> Option<&str> {
        self.last_yielded.as_deref()
    }

    /// The next page, or `None` once the generation is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Vec<CredentialRecord>>> {
        if !self.buffer.is_empty() {
            let batch: Vec<_> = self.buffer.drain(..).collect();
            self.last_yielded = batch.last().map(|r| r.id.clone());
            return Ok(Some(batch));
        }
        if self.exhausted {
            return Ok(None);
        }
        let page = self.fetch()?;
        if page.is_empty() {
            return Ok(None);
        }
        self.last_yielded = page.last().map(|r| r.id.clone());
        Ok(Some(page))
    }

    fn fetch(&mut self) -> Result<Vec<CredentialRecord>> {
        let page = self
            .store
            .fetch_page(self.generation, self.page_after.as_deref(), self.batch_size)?;
        if page.len() < self.batch_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.page_after = Some(last.id.clone());
        }
        Ok(page)
    }
}

impl Iterator for GenerationScan<'_> {
    type Item = Result<CredentialRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.fetch() {
                Ok(page) => self.buffer.extend(page),
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        let record = self.buffer.pop_front()?;
        self.last_yielded = Some(record.id.clone());
        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::store::CredentialStore;
    use crate::testing::MemoryKeyStore;
    use crate::types::{Generation, NewCredential};

    async fn seeded(n: usize) -> CredentialStore {
        let keys = Arc::new(MemoryKeyStore::bootstrap());
        let store = CredentialStore::open_in_memory(keys).unwrap();
        for i in 0..n {
            store
                .put(NewCredential::new("r1", "admin", "pw").with_id(&format!("cred-{i:03}")))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn iterates_all_records_in_id_order() {
        let store = seeded(7).await;
        let ids: Vec<String> = store
            .list_by_generation(Generation(1), 3)
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(ids.len(), 7);
        assert_eq!(ids.first().unwrap(), "cred-000");
        assert_eq!(ids.last().unwrap(), "cred-006");
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn batches_are_bounded() {
        let store = seeded(5).await;
        let mut scan = store.list_by_generation(Generation(1), 2);
        let mut sizes = vec![];
        while let Some(batch) = scan.next_batch().unwrap() {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(scan.cursor(), Some("cred-004"));
    }

    #[tokio::test]
    async fn resumes_after_cursor() {
        let store = seeded(5).await;
        let rest: Vec<String> = store
            .list_by_generation(Generation(1), 10)
            .resume_after("cred-002")
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(rest, vec!["cred-003", "cred-004"]);
    }

    #[tokio::test]
    async fn other_generation_is_empty() {
        let store = seeded(3).await;
        assert_eq!(store.list_by_generation(Generation(2), 10).count(), 0);
    }
}
