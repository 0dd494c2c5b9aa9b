//! Remote state bridge
//!
//! Exposes another stack's persisted outputs to the stack being planned.
//! State is loaded lazily on the first request for a backing stack and the
//! parsed output map is cached for the rest of the plan/apply cycle. Changes
//! made to that state elsewhere during the cycle are not observed.

use crate::error::{Error, Result};
use crate::stack::RemoteStateSource;
use crate::state::StateReader;
use crate::value::{OutputShape, OutputValue};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type OutputMap = BTreeMap<String, OutputValue>;

/// Lazy, caching reader of remote stack outputs
pub struct RemoteStateBridge<'a> {
    reader: &'a dyn StateReader,
    cache: Mutex<BTreeMap<String, Arc<OutputMap>>>,
}

impl<'a> RemoteStateBridge<'a> {
    pub fn new(reader: &'a dyn StateReader) -> Self {
        Self {
            reader,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Scalar output `key` of `source`
    pub fn get_output(&self, source: &RemoteStateSource, key: &str) -> Result<String> {
        match self.get(source, key, OutputShape::Scalar)? {
            OutputValue::String(s) => Ok(s),
            OutputValue::List(_) => {
                Err(type_error(source, key, OutputShape::Scalar, OutputShape::List))
            }
        }
    }

    /// List output `key` of `source`
    pub fn get_output_list(&self, source: &RemoteStateSource, key: &str) -> Result<Vec<String>> {
        match self.get(source, key, OutputShape::List)? {
            OutputValue::List(items) => Ok(items),
            OutputValue::String(_) => {
                Err(type_error(source, key, OutputShape::List, OutputShape::Scalar))
            }
        }
    }

    /// Output `key` of `source`, checked against `shape`
    pub fn get(
        &self,
        source: &RemoteStateSource,
        key: &str,
        shape: OutputShape,
    ) -> Result<OutputValue> {
        let outputs = self.outputs(source)?;
        let value = outputs
            .get(key)
            .ok_or_else(|| Error::RemoteStateUnavailable {
                source_id: source.id.clone(),
                stack: source.stack.clone(),
                key: Some(key.to_string()),
            })?;
        if value.shape() != shape {
            return Err(type_error(source, key, shape, value.shape()));
        }
        Ok(value.clone())
    }

    /// Whether `stack`'s outputs are already cached
    pub fn is_loaded(&self, stack: &str) -> bool {
        self.lock().contains_key(stack)
    }

    fn outputs(&self, source: &RemoteStateSource) -> Result<Arc<OutputMap>> {
        if let Some(cached) = self.lock().get(&source.stack) {
            return Ok(Arc::clone(cached));
        }

        let state = self
            .reader
            .read(&source.stack)?
            .ok_or_else(|| Error::RemoteStateUnavailable {
                source_id: source.id.clone(),
                stack: source.stack.clone(),
                key: None,
            })?;
        log::debug!(
            "loaded remote state '{}' from stack '{}' (serial {}, {} outputs)",
            source.id,
            source.stack,
            state.serial,
            state.outputs.len()
        );

        let outputs = Arc::new(state.outputs);
        self.lock()
            .entry(source.stack.clone())
            .or_insert_with(|| Arc::clone(&outputs));
        Ok(outputs)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<OutputMap>>> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn type_error(
    source: &RemoteStateSource,
    key: &str,
    expected: OutputShape,
    found: OutputShape,
) -> Error {
    Error::RemoteStateType {
        source_id: source.id.clone(),
        key: key.to_string(),
        expected,
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryStateStore, StackState, StateStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReader {
        inner: MemoryStateStore,
        reads: AtomicUsize,
    }

    impl StateReader for CountingReader {
        fn read(&self, stack: &str) -> Result<Option<StackState>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(stack)
        }
    }

    fn source() -> RemoteStateSource {
        RemoteStateSource {
            id: "vpc-state".into(),
            stack: "network".into(),
        }
    }

    fn applied_network() -> MemoryStateStore {
        MemoryStateStore::new().with_outputs(
            "network",
            [
                ("vpc_id", OutputValue::String("vpc-0a1b".into())),
                (
                    "vpc_public_subnets",
                    OutputValue::List(vec!["subnet-a".into(), "subnet-b".into()]),
                ),
            ],
        )
    }

    #[test]
    fn test_scalar_and_list_reads() {
        let store = applied_network();
        let bridge = RemoteStateBridge::new(&store);
        assert_eq!(bridge.get_output(&source(), "vpc_id").unwrap(), "vpc-0a1b");
        assert_eq!(
            bridge.get_output_list(&source(), "vpc_public_subnets").unwrap(),
            vec!["subnet-a".to_string(), "subnet-b".to_string()]
        );
    }

    #[test]
    fn test_unapplied_stack_is_unavailable() {
        let store = MemoryStateStore::new();
        let bridge = RemoteStateBridge::new(&store);
        let err = bridge.get_output(&source(), "vpc_id").unwrap_err();
        assert!(matches!(err, Error::RemoteStateUnavailable { key: None, .. }));
    }

    #[test]
    fn test_missing_key_never_defaults() {
        let store = applied_network();
        let bridge = RemoteStateBridge::new(&store);
        let err = bridge.get_output(&source(), "vpc_intra_subnets").unwrap_err();
        assert!(matches!(
            err,
            Error::RemoteStateUnavailable { key: Some(ref k), .. } if k == "vpc_intra_subnets"
        ));
        assert!(bridge.get_output_list(&source(), "vpc_intra_subnets").is_err());
    }

    #[test]
    fn test_shape_mismatch() {
        let store = applied_network();
        let bridge = RemoteStateBridge::new(&store);
        assert!(matches!(
            bridge.get_output(&source(), "vpc_public_subnets"),
            Err(Error::RemoteStateType {
                expected: OutputShape::Scalar,
                found: OutputShape::List,
                ..
            })
        ));
        assert!(matches!(
            bridge.get_output_list(&source(), "vpc_id"),
            Err(Error::RemoteStateType {
                expected: OutputShape::List,
                found: OutputShape::Scalar,
                ..
            })
        ));
    }

    #[test]
    fn test_lazy_load_and_snapshot() {
        let reader = CountingReader {
            inner: applied_network(),
            reads: AtomicUsize::new(0),
        };
        let bridge = RemoteStateBridge::new(&reader);
        assert_eq!(reader.reads.load(Ordering::SeqCst), 0);
        assert!(!bridge.is_loaded("network"));

        bridge.get_output(&source(), "vpc_id").unwrap();
        bridge.get_output_list(&source(), "vpc_public_subnets").unwrap();
        assert_eq!(reader.reads.load(Ordering::SeqCst), 1);

        // Later writes are not observed within the same pass
        let mut changed = StackState::next("network", None);
        changed
            .outputs
            .insert("vpc_id".into(), OutputValue::String("vpc-new".into()));
        reader.inner.write(&changed).unwrap();
        assert_eq!(bridge.get_output(&source(), "vpc_id").unwrap(), "vpc-0a1b");
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let store = MemoryStateStore::new();
        let bridge = RemoteStateBridge::new(&store);
        assert!(bridge.get_output(&source(), "vpc_id").is_err());

        let mut state = StackState::next("network", None);
        state
            .outputs
            .insert("vpc_id".into(), OutputValue::String("vpc-late".into()));
        store.write(&state).unwrap();
        assert_eq!(bridge.get_output(&source(), "vpc_id").unwrap(), "vpc-late");
    }
}
