#![expect(
    clippy::module_name_repetitions,
    reason = "Pending-request types expose their domain in the name for clarity"
)]

//! In-flight request bookkeeping.
//!
//! Every `fetch` registers a [`CorrelationKey`] here before its frame is written, and the entry is
//! removed exactly once by whichever of response, timeout, disconnect or close gets to it first.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::Result;
use crate::error::{DuplicateKey, Error};

/// Identifies one logical request on the shared connection.
///
/// The same product may be requested concurrently, so the product identifier alone is not unique;
/// the monotonic sequence number disambiguates. Ordering is by product first, then sequence, which
/// lets the table find the oldest request for a product.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationKey {
    pub product_id: String,
    pub sequence: u64,
}

impl CorrelationKey {
    #[must_use]
    pub fn new<S: Into<String>>(product_id: S, sequence: u64) -> Self {
        Self {
            product_id: product_id.into(),
            sequence,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.product_id, self.sequence)
    }
}

struct PendingRequest<T> {
    issued_at: Instant,
    deadline: Instant,
    completion: oneshot::Sender<Result<T>>,
}

struct Entries<T> {
    requests: BTreeMap<CorrelationKey, PendingRequest<T>>,
    /// One past the highest sequence ever registered
    issued: u64,
    sealed: bool,
}

impl<T> Entries<T> {
    fn take_oldest(&mut self, product_id: &str) -> Option<PendingRequest<T>> {
        let lower = CorrelationKey::new(product_id, 0);
        let upper = CorrelationKey::new(product_id, u64::MAX);

        let oldest = self
            .requests
            .range(lower..=upper)
            .next()
            .map(|(key, _)| key.clone())?;
        self.requests.remove(&oldest)
    }
}

/// Map from correlation key to the caller waiting on it.
///
/// All mutations go through a single mutex, which makes [`PendingTable::resolve`] the one place
/// where competing completions are serialized.
pub struct PendingTable<T> {
    entries: Mutex<Entries<T>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Entries {
                requests: BTreeMap::new(),
                issued: 0,
                sealed: false,
            }),
        }
    }
}

impl<T> PendingTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map half-updated: every mutation is a
    // single insert or remove.
    fn lock(&self) -> MutexGuard<'_, Entries<T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new pending request.
    ///
    /// Fails with [`Kind::DuplicateKey`](crate::error::Kind::DuplicateKey) when the key is already
    /// present and with [`Kind::ClientClosed`](crate::error::Kind::ClientClosed) once the table has
    /// been sealed.
    pub fn register(
        self: &Arc<Self>,
        key: CorrelationKey,
        deadline: Instant,
    ) -> Result<Registration<T>> {
        let (completion, receiver) = oneshot::channel();
        let mut entries = self.lock();

        if entries.sealed {
            return Err(Error::client_closed());
        }

        if entries.requests.contains_key(&key) {
            #[cfg(feature = "tracing")]
            tracing::error!(%key, "correlation key registered twice");
            return Err(DuplicateKey {
                key: key.to_string(),
            }
            .into());
        }

        entries.issued = entries.issued.max(key.sequence.saturating_add(1));
        entries.requests.insert(
            key.clone(),
            PendingRequest {
                issued_at: Instant::now(),
                deadline,
                completion,
            },
        );

        Ok(Registration {
            table: Arc::clone(self),
            key,
            receiver,
        })
    }

    /// Remove the entry for `key` and complete it with `result`.
    ///
    /// Returns `false` without doing anything if the entry was already resolved or removed.
    pub fn resolve(&self, key: &CorrelationKey, result: Result<T>) -> bool {
        let Some(request) = self.lock().requests.remove(key) else {
            return false;
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(
            %key,
            elapsed = ?request.issued_at.elapsed(),
            ok = result.is_ok(),
            "resolved request"
        );

        // The receiver may already be gone if the caller stopped waiting.
        _ = request.completion.send(result);
        true
    }

    /// Resolve the oldest pending request for `product_id`.
    ///
    /// Used when a response names the product but does not echo the request sequence.
    pub fn resolve_oldest(&self, product_id: &str, result: Result<T>) -> bool {
        let removed = self.lock().take_oldest(product_id);

        match removed {
            Some(request) => {
                _ = request.completion.send(result);
                true
            }
            None => false,
        }
    }

    /// Resolve a response that echoed both product and sequence.
    ///
    /// A sequence this table never issued did not come from us, so the response falls back to the
    /// oldest pending request for the product. A sequence that was issued but is no longer pending
    /// belongs to a request that already completed, and the response is dropped.
    pub fn resolve_echoed(&self, key: &CorrelationKey, result: Result<T>) -> bool {
        let removed = {
            let mut entries = self.lock();
            match entries.requests.remove(key) {
                Some(request) => Some(request),
                None if key.sequence >= entries.issued => entries.take_oldest(&key.product_id),
                None => None,
            }
        };

        match removed {
            Some(request) => {
                _ = request.completion.send(result);
                true
            }
            None => false,
        }
    }

    /// Resolve the request issued with `sequence`, whatever its product.
    ///
    /// Sequences are unique within a table, so at most one entry matches.
    pub fn resolve_sequence(&self, sequence: u64, result: Result<T>) -> bool {
        let removed = {
            let mut entries = self.lock();
            let key = entries
                .requests
                .keys()
                .find(|key| key.sequence == sequence)
                .cloned();
            key.and_then(|key| entries.requests.remove(&key))
        };

        match removed {
            Some(request) => {
                _ = request.completion.send(result);
                true
            }
            None => false,
        }
    }

    /// Complete every pending request with an error built by `make_error`.
    ///
    /// The table is emptied under a single lock acquisition, so no request can be left behind.
    /// Returns the number of requests drained.
    pub fn drain_all<F>(&self, make_error: F) -> usize
    where
        F: FnMut(&CorrelationKey) -> Error,
    {
        let drained = std::mem::take(&mut self.lock().requests);
        Self::complete_all(drained, make_error)
    }

    /// Drain every pending request and reject all future registrations.
    pub fn seal<F>(&self, make_error: F) -> usize
    where
        F: FnMut(&CorrelationKey) -> Error,
    {
        let drained = {
            let mut entries = self.lock();
            entries.sealed = true;
            std::mem::take(&mut entries.requests)
        };
        Self::complete_all(drained, make_error)
    }

    /// Fail every request whose deadline is at or before `now` with a timeout.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let overdue: Vec<(CorrelationKey, PendingRequest<T>)> = {
            let mut entries = self.lock();
            let keys: Vec<CorrelationKey> = entries
                .requests
                .iter()
                .filter(|(_, request)| request.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.requests.remove(&key).map(|request| (key, request)))
                .collect()
        };

        let count = overdue.len();
        for (key, request) in overdue {
            let after = request.deadline.saturating_duration_since(request.issued_at);
            _ = request
                .completion
                .send(Err(Error::timeout(key.product_id, after)));
        }
        count
    }

    fn complete_all<F>(
        drained: BTreeMap<CorrelationKey, PendingRequest<T>>,
        mut make_error: F,
    ) -> usize
    where
        F: FnMut(&CorrelationKey) -> Error,
    {
        let count = drained.len();
        for (key, request) in drained {
            _ = request.completion.send(Err(make_error(&key)));
        }
        count
    }

    /// Drop the entry without completing it. Used when the caller stops waiting.
    fn remove(&self, key: &CorrelationKey) -> bool {
        self.lock().requests.remove(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().requests.is_empty()
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }
}

/// The caller's side of a pending request.
///
/// Dropping a registration removes its table entry, so an abandoned `fetch` never leaves a
/// dangling request behind.
pub struct Registration<T> {
    table: Arc<PendingTable<T>>,
    key: CorrelationKey,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Registration<T> {
    #[must_use]
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Completion handle for this request.
    pub fn receiver(&mut self) -> &mut oneshot::Receiver<Result<T>> {
        &mut self.receiver
    }

    /// Resolve this request from the caller's side, e.g. when its deadline fires.
    ///
    /// Returns `false` if something else already completed it; the winning result is then
    /// waiting in the receiver.
    pub fn resolve(&self, result: Result<T>) -> bool {
        self.table.resolve(&self.key, result)
    }
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        self.table.remove(&self.key);
    }
}
