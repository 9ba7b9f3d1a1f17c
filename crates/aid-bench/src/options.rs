//! Shared option-list cache.
//!
//! One [`OptionsCache`] per option kind lives for the whole session and is
//! shared by `Arc`.  It has one writer (a completed fetch) and any number of
//! readers.  Readers hold an [`OptionsSubscription`]; the first `next()` yields
//! the current list immediately, later calls wait for a replacement.
//!
//! At most one fetch runs at a time.  A caller that arrives while a fetch is
//! in flight does not queue a second request; it gets [`LoadOutcome::InFlight`]
//! and picks the result up from its subscription.  Once a list has been
//! fetched for an (endpoint, key) pair, asking again for that pair is
//! answered from the cache.

use aid_proto::protocol::{OptionItem, OptionKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiError, OptionsClient};

pub type OptionList = Arc<Vec<OptionItem>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// This call fetched and broadcast a list of the given length.
    Fetched(usize),
    /// Another fetch was already running; nothing was sent.
    InFlight,
    /// The cached list already belongs to this (endpoint, key) pair.
    Cached(usize),
}

/// The (endpoint, key) pair the cached list was fetched with.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Source {
    endpoint: String,
    api_key: String,
}

pub struct OptionsCache {
    kind: OptionKind,
    client: OptionsClient,
    tx: watch::Sender<OptionList>,
    in_flight: AtomicBool,
    loaded_from: Mutex<Option<Source>>,
    fetches: AtomicU64,
}

impl OptionsCache {
    pub fn new(kind: OptionKind, client: OptionsClient) -> Self {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            kind,
            client,
            tx,
            in_flight: AtomicBool::new(false),
            loaded_from: Mutex::new(None),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> OptionsSubscription {
        OptionsSubscription {
            rx: self.tx.subscribe(),
            primed: false,
        }
    }

    pub fn current(&self) -> OptionList {
        Arc::clone(&self.tx.borrow())
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Number of network requests this cache has started.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Fetch the list unless it is already cached for this pair or a fetch
    /// is already running.
    ///
    /// On failure the cached list is left untouched and the error is handed
    /// back for the caller to report; the next call retries.  The in-flight
    /// flag is released on every exit path, including the future being
    /// dropped mid-request.
    pub async fn ensure_loaded(
        &self,
        endpoint: &str,
        api_key: &str,
    ) -> Result<LoadOutcome, ApiError> {
        let source = Source {
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        };
        if self.loaded_from().as_ref() == Some(&source) {
            debug!("{} options: already cached for {}", self.kind, endpoint);
            return Ok(LoadOutcome::Cached(self.current().len()));
        }
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("{} options: fetch already in flight, skipping", self.kind);
            return Ok(LoadOutcome::InFlight);
        };
        self.fetches.fetch_add(1, Ordering::Relaxed);

        match self.client.fetch_options(self.kind, endpoint, api_key).await {
            Ok(items) => {
                let count = items.len();
                self.tx.send_replace(Arc::new(items));
                *self.loaded_from() = Some(source);
                info!("{} options: cached {} item(s) from {}", self.kind, count, endpoint);
                Ok(LoadOutcome::Fetched(count))
            }
            Err(e) => {
                warn!("{} options: fetch from {} failed: {}", self.kind, endpoint, e);
                Err(e)
            }
        }
    }

    fn loaded_from(&self) -> MutexGuard<'_, Option<Source>> {
        self.loaded_from
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A reader of an [`OptionsCache`].  Dropping it unsubscribes.
///
/// Readers that fall behind skip straight to the newest list.
pub struct OptionsSubscription {
    rx: watch::Receiver<OptionList>,
    primed: bool,
}

impl OptionsSubscription {
    /// The current list on the first call, then each replacement.  `None`
    /// once the cache is gone.
    pub async fn next(&mut self) -> Option<OptionList> {
        if self.primed {
            self.rx.changed().await.ok()?;
        }
        self.primed = true;
        let value = Arc::clone(&self.rx.borrow_and_update());
        Some(value)
    }
}
