//! Volatile enumerator kept in a hash map.

use crate::codec::EqualityPolicy;
use crate::enumerator::DataEnumerator;
use enumdb_common::Result;
use parking_lot::RwLock;
use std::collections::HashMap;

struct Inner<T> {
    values: Vec<T>,
    by_hash: HashMap<i32, Vec<i32>>,
}

/// Enumerator with no persistence, for tests and scratch work.
pub struct InMemoryEnumerator<T, E> {
    equality: E,
    inner: RwLock<Inner<T>>,
}

impl<T, E: EqualityPolicy<T>> InMemoryEnumerator<T, E> {
    pub fn new(equality: E) -> Self {
        Self {
            equality,
            inner: RwLock::new(Inner {
                values: Vec::new(),
                by_hash: HashMap::new(),
            }),
        }
    }

    fn find(&self, inner: &Inner<T>, hash: i32, value: &T) -> Option<i32> {
        inner.by_hash.get(&hash).and_then(|ids| {
            ids.iter()
                .copied()
                .find(|&id| self.equality.equals(&inner.values[id as usize - 1], value))
        })
    }
}

impl<T, E> DataEnumerator<T> for InMemoryEnumerator<T, E>
where
    T: Clone + Send + Sync,
    E: EqualityPolicy<T>,
{
    fn enumerate(&self, value: Option<&T>) -> Result<i32> {
        let Some(value) = value else {
            return Ok(0);
        };
        let hash = self.equality.hash(value);
        if let Some(id) = self.find(&self.inner.read(), hash, value) {
            return Ok(id);
        }

        let mut inner = self.inner.write();
        // Another writer may have added it between the locks
        if let Some(id) = self.find(&inner, hash, value) {
            return Ok(id);
        }
        inner.values.push(value.clone());
        let id = inner.values.len() as i32;
        inner.by_hash.entry(hash).or_default().push(id);
        Ok(id)
    }

    fn try_enumerate(&self, value: Option<&T>) -> Result<i32> {
        Ok(value
            .and_then(|value| self.find(&self.inner.read(), self.equality.hash(value), value))
            .unwrap_or(0))
    }

    fn value_of(&self, id: i32) -> Result<Option<T>> {
        if id <= 0 {
            return Ok(None);
        }
        Ok(self.inner.read().values.get(id as usize - 1).cloned())
    }

    fn for_each(&self, visitor: &mut dyn FnMut(i32, &T) -> bool) -> Result<bool> {
        let values = self.inner.read().values.clone();
        for (index, value) in values.iter().enumerate() {
            if !visitor(index as i32 + 1, value) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn records_count(&self) -> Result<i32> {
        Ok(self.inner.read().values.len() as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ContentEquality;

    #[test]
    fn test_in_memory_contract() {
        let e = InMemoryEnumerator::<String, _>::new(ContentEquality);
        let foo = "foo".to_string();
        let bar = "bar".to_string();
        assert_eq!(e.enumerate(Some(&foo)).unwrap(), 1);
        assert_eq!(e.enumerate(Some(&bar)).unwrap(), 2);
        assert_eq!(e.enumerate(Some(&foo)).unwrap(), 1);
        assert_eq!(e.enumerate(None).unwrap(), 0);
        assert_eq!(e.value_of(1).unwrap(), Some(foo));
        assert_eq!(e.value_of(2).unwrap(), Some(bar));
        assert_eq!(e.value_of(3).unwrap(), None);
        assert_eq!(e.value_of(-1).unwrap(), None);
        assert_eq!(e.try_enumerate(Some(&"baz".to_string())).unwrap(), 0);
        assert_eq!(e.records_count().unwrap(), 2);
    }

    #[test]
    fn test_shared_hash_values_get_own_ids() {
        let e = InMemoryEnumerator::<String, _>::new(ContentEquality);
        let aa = "Aa".to_string();
        let bb = "BB".to_string();
        assert_eq!(e.enumerate(Some(&aa)).unwrap(), 1);
        assert_eq!(e.enumerate(Some(&bb)).unwrap(), 2);
        assert_eq!(e.try_enumerate(Some(&aa)).unwrap(), 1);
        assert_eq!(e.try_enumerate(Some(&bb)).unwrap(), 2);
    }

    #[test]
    fn test_for_each_stops_early() {
        let e = InMemoryEnumerator::<String, _>::new(ContentEquality);
        for n in 0..10 {
            e.enumerate(Some(&format!("v{n}"))).unwrap();
        }
        let mut ids = Vec::new();
        let completed = e
            .for_each(&mut |id, _: &String| {
                ids.push(id);
                id < 3
            })
            .unwrap();
        assert!(!completed);
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
