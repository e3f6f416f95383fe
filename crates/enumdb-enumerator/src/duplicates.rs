//! Linked lists of ids whose values share a hash.
//!
//! Record `r` (1-based) lives at `(r - 1) * 8` and holds `(id: i32, next: i32)`;
//! `next == 0` ends the list. The B-tree stores `-r` for the list head.

use enumdb_common::{Cancellation, Result, StorageError};
use enumdb_storage::ResizeableMappedFile;

const RECORD_SIZE: u64 = 8;

pub(crate) struct DuplicateLists {
    file: ResizeableMappedFile,
}

impl DuplicateLists {
    pub fn open(file: ResizeableMappedFile) -> Result<Self> {
        if file.len() % RECORD_SIZE != 0 {
            return Err(StorageError::corrupted(format!(
                "duplicate list file {} has {} bytes, not a multiple of {RECORD_SIZE}",
                file.path().display(),
                file.len()
            )));
        }
        Ok(Self { file })
    }

    /// Number of records written.
    pub fn count(&self) -> u64 {
        self.file.len() / RECORD_SIZE
    }

    /// Appends a record and returns its index.
    pub fn push(&self, id: i32, next: i32) -> Result<i32> {
        let index = i32::try_from(self.count() + 1).map_err(|_| StorageError::InvalidParameter {
            name: "duplicate_record".to_string(),
            value: "record space exhausted".to_string(),
        })?;
        let order = self.file.storage().byte_order();
        let mut record = [0u8; RECORD_SIZE as usize];
        order.write_i32(&mut record, 0, id);
        order.write_i32(&mut record, 4, next);
        let offset = self.file.append(&record)?;
        debug_assert_eq!(offset, (index as u64 - 1) * RECORD_SIZE);
        Ok(index)
    }

    fn get(&self, index: i32) -> Result<(i32, i32)> {
        if index <= 0 || index as u64 > self.count() {
            return Err(StorageError::corrupted(format!(
                "duplicate record {index} outside 1..={}",
                self.count()
            )));
        }
        let offset = (index as u64 - 1) * RECORD_SIZE;
        let id = self.file.get_i32(offset)?;
        let next = self.file.get_i32(offset + 4)?;
        if id <= 0 || next < 0 {
            return Err(StorageError::corrupted(format!(
                "duplicate record {index} holds id {id}, next {next}"
            )));
        }
        Ok((id, next))
    }

    /// Collects the ids of the list starting at `head`, newest first.
    pub fn ids(&self, head: i32, cancellation: &dyn Cancellation) -> Result<Vec<i32>> {
        let mut ids = Vec::new();
        let mut index = head;
        while index != 0 {
            cancellation.check_cancelled()?;
            if ids.len() as u64 >= self.count() {
                return Err(StorageError::corrupted(format!(
                    "duplicate list at {head} loops"
                )));
            }
            let (id, next) = self.get(index)?;
            ids.push(id);
            index = next;
        }
        Ok(ids)
    }

    pub fn force(&self) -> Result<()> {
        self.file.force()
    }

    pub fn close(&self) -> Result<()> {
        self.file.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enumdb_common::{ByteOrder, CancellationFlag, NeverCancelled};
    use enumdb_storage::InMemoryStorage;
    use std::path::Path;

    fn lists() -> DuplicateLists {
        let storage = Box::new(InMemoryStorage::new(Path::new("dups"), ByteOrder::BigEndian));
        DuplicateLists::open(ResizeableMappedFile::open(storage, 64).unwrap()).unwrap()
    }

    #[test]
    fn test_lists_chain_newest_first() {
        let lists = lists();
        let first = lists.push(3, 0).unwrap();
        let second = lists.push(8, first).unwrap();
        let third = lists.push(11, second).unwrap();
        let other = lists.push(5, 0).unwrap();
        assert_eq!((first, second, third, other), (1, 2, 3, 4));

        assert_eq!(lists.ids(third, &NeverCancelled).unwrap(), vec![11, 8, 3]);
        assert_eq!(lists.ids(other, &NeverCancelled).unwrap(), vec![5]);
        assert_eq!(lists.ids(0, &NeverCancelled).unwrap(), Vec::<i32>::new());
    }

    #[test]
    fn test_loop_is_corruption() {
        let lists = lists();
        lists.push(1, 2).unwrap();
        lists.push(2, 1).unwrap();
        assert!(lists.ids(1, &NeverCancelled).unwrap_err().is_corruption());
    }

    #[test]
    fn test_dangling_index_is_corruption() {
        let lists = lists();
        lists.push(1, 9).unwrap();
        assert!(lists.ids(1, &NeverCancelled).unwrap_err().is_corruption());
        assert!(lists.ids(-1, &NeverCancelled).unwrap_err().is_corruption());
    }

    #[test]
    fn test_scan_observes_cancellation() {
        let lists = lists();
        let head = lists.push(1, 0).unwrap();
        let flag = CancellationFlag::new();
        flag.cancel();
        let err = lists.ids(head, &flag).unwrap_err();
        assert!(err.is_cancellation());
        assert!(!err.is_corruption());
    }
}
