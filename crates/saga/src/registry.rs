//! Active saga instances, owned by the service.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::SagaId;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Result, SagaError};
use crate::instance::{SagaInstance, SagaView};

/// Shared handle to one saga. Holding its lock serializes every mutation of
/// that saga.
pub type SagaHandle = Arc<Mutex<SagaInstance>>;

/// Lifetime counters of a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SagaStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub active: usize,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Table of active sagas keyed by id.
#[derive(Clone, Default)]
pub struct SagaRegistry {
    sagas: Arc<RwLock<HashMap<SagaId, SagaHandle>>>,
    counters: Arc<Counters>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new saga. Fails if one with the same id is active.
    pub async fn insert(&self, saga: SagaInstance) -> Result<SagaHandle> {
        let mut sagas = self.sagas.write().await;
        if sagas.contains_key(saga.id()) {
            return Err(SagaError::AlreadyStarted(saga.id().clone()));
        }
        let id = saga.id().clone();
        let handle = Arc::new(Mutex::new(saga));
        sagas.insert(id, handle.clone());
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    pub async fn get(&self, id: &SagaId) -> Option<SagaHandle> {
        self.sagas.read().await.get(id).cloned()
    }

    /// Removes a saga without counting an outcome.
    pub async fn remove(&self, id: &SagaId) -> Option<SagaHandle> {
        self.sagas.write().await.remove(id)
    }

    /// Removes a saga that never got going and takes it back out of the
    /// started count.
    pub async fn discard(&self, id: &SagaId) {
        if self.remove(id).await.is_some() {
            self.counters.started.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Removes a saga that completed.
    pub async fn finish_completed(&self, id: &SagaId) {
        if self.remove(id).await.is_some() {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Removes a saga that failed and was compensated.
    pub async fn finish_failed(&self, id: &SagaId) {
        if self.remove(id).await.is_some() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn contains(&self, id: &SagaId) -> bool {
        self.sagas.read().await.contains_key(id)
    }

    pub async fn active_count(&self) -> usize {
        self.sagas.read().await.len()
    }

    /// Snapshot of one saga.
    pub async fn view(&self, id: &SagaId) -> Option<SagaView> {
        let handle = self.get(id).await?;
        let saga = handle.lock().await;
        Some(saga.view())
    }

    pub async fn stats(&self) -> SagaStats {
        SagaStats {
            started: self.counters.started.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            active: self.active_count().await,
        }
    }
}
