//! Concurrent refresh engine
//!
//! The crawler owns one scheduler task per group. Each scheduler performs an
//! immediate refresh and then refreshes on a fixed period until the engine
//! is cancelled. A refresh fans out one fetch task per subscription, bounded
//! across all groups by a shared semaphore, joins the results, and publishes
//! the merged artifact atomically to the in-memory result cache.

pub mod client;
pub mod fetcher;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Group;
use crate::error::{panic_message, FetchError, GroupError};
use fetcher::SubscriptionFetcher;

/// Capacity hint: expected URL count per subscription.
const AVG_SUBSCRIPTION_URLS: usize = 10;

/// One group plus its refresh serialization lock. Periodic and forced
/// refreshes of the same group go through this lock, so they never overlap
/// and every published artifact reflects exactly one completed refresh.
struct GroupState {
    config: Group,
    refresh_lock: Mutex<()>,
}

/// The crawler engine: group schedulers, fetch fan-out, and result cache.
pub struct Crawler {
    inner: Arc<Inner>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

/// Engine state shared between the public handle and the scheduler tasks.
struct Inner {
    groups: HashMap<String, Arc<GroupState>>,
    results: RwLock<HashMap<String, Bytes>>,
    fetcher: Arc<SubscriptionFetcher>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Crawler {
    /// Create a crawler for the given groups.
    ///
    /// `max_concurrent` bounds in-flight subscription fetches across all
    /// groups. The HTTP client timeouts are derived from the largest
    /// subscription timeout.
    pub fn new(
        groups: Vec<Group>,
        user_agent: &str,
        retries: u32,
        max_concurrent: usize,
    ) -> Result<Self> {
        let mut max_timeout = Duration::ZERO;
        let mut group_map = HashMap::with_capacity(groups.len());

        for group in groups {
            max_timeout = max_timeout.max(group.max_subscription_timeout());
            group_map.insert(
                group.name.clone(),
                Arc::new(GroupState {
                    config: group,
                    refresh_lock: Mutex::new(()),
                }),
            );
        }

        let fetcher = SubscriptionFetcher::new(user_agent, retries, max_timeout)
            .context("failed to build HTTP client")?;

        Ok(Self {
            inner: Arc::new(Inner {
                groups: group_map,
                results: RwLock::new(HashMap::new()),
                fetcher: Arc::new(fetcher),
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                cancel: CancellationToken::new(),
            }),
            handles: StdMutex::new(Vec::new()),
        })
    }

    /// Start one scheduler task per group.
    pub fn run(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);

        for state in self.inner.groups.values() {
            let inner = Arc::clone(&self.inner);
            let group = Arc::clone(state);
            handles.push(tokio::spawn(async move {
                inner.run_group(group).await;
            }));
        }
    }

    /// Cancel the engine and wait for every scheduler to finish. A refresh
    /// in progress is allowed to complete, but no new one is started.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "group handler join error");
            }
        }
        info!("crawler stopped");
    }

    /// Return the group's current artifact.
    ///
    /// `force` runs a synchronous refresh first. `decode` base64-decodes the
    /// stored artifact of an encoded group (no-op for plain groups or empty
    /// artifacts). Fails with `GroupError::NotFound` for an unknown group or
    /// when no refresh has ever completed for it.
    pub async fn get(
        &self,
        group_name: &str,
        force: bool,
        decode: bool,
    ) -> Result<Bytes, GroupError> {
        self.inner.get(group_name, force, decode).await
    }
}

impl Inner {
    async fn get(&self, group_name: &str, force: bool, decode: bool) -> Result<Bytes, GroupError> {
        let group = self
            .groups
            .get(group_name)
            .ok_or_else(|| GroupError::NotFound(group_name.to_string()))?;

        if force {
            self.refresh_group(group).await;
        }

        let result = self
            .results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_name)
            .cloned();

        let Some(artifact) = result else {
            return Err(GroupError::NotFound(group_name.to_string()));
        };

        if decode && group.config.encoded && !artifact.is_empty() {
            let decoded = STANDARD.decode(&artifact).map_err(|err| {
                error!(group = group_name, error = %err, "artifact decode error");
                GroupError::Decode(err)
            })?;
            debug!(group = group_name, size = decoded.len(), "artifact decoded");
            return Ok(Bytes::from(decoded));
        }

        Ok(artifact)
    }

    /// Periodic refresh loop for a single group: refresh immediately, then
    /// on every period tick until the engine is cancelled. Ticks arriving
    /// while a refresh is still running are coalesced.
    async fn run_group(&self, group: Arc<GroupState>) {
        let period = group.config.period;
        info!(group = %group.config.name, period = ?period, "starting group handler");

        self.refresh_group(&group).await;

        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(group = %group.config.name, "group handler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    debug!(group = %group.config.name, "group handler tick");
                    self.refresh_group(&group).await;
                }
            }
        }
    }

    /// Run one complete refresh: fetch every subscription, join exactly one
    /// result per subscription, merge, and publish the artifact.
    async fn refresh_group(&self, group: &GroupState) {
        let _refresh = group.refresh_lock.lock().await;

        let name = group.config.name.as_str();
        let subscriptions = &group.config.subscriptions;
        info!(group = name, subscriptions = subscriptions.len(), "refreshing group");
        let start = std::time::Instant::now();

        let mut tasks = JoinSet::new();
        for sub in subscriptions {
            // acquire before spawning so a storm of slow subscriptions in
            // one group backpressures the whole process
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(group = name, "semaphore closed, aborting fan-out");
                    break;
                }
            };

            let fetcher = Arc::clone(&self.fetcher);
            let cancel = self.cancel.clone();
            let group_name = group.config.name.clone();
            let sub = sub.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let result = fetcher.fetch(&group_name, &sub, &cancel).await;
                (sub.name, result)
            });
        }

        let mut urls = Vec::with_capacity(subscriptions.len() * AVG_SUBSCRIPTION_URLS);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(mut sub_urls))) => urls.append(&mut sub_urls),
                Ok((sub_name, Err(err))) => {
                    error!(group = name, subscription = %sub_name, error = %err, "subscription fetch failed");
                }
                Err(join_err) => {
                    let err = if join_err.is_panic() {
                        FetchError::Panic(panic_message(join_err.into_panic().as_ref()))
                    } else {
                        FetchError::Cancelled
                    };
                    error!(group = name, error = %err, "subscription task failed");
                }
            }
        }

        let url_count = urls.len();
        let artifact = merge_tokens(urls, group.config.encoded);
        let size = artifact.len();

        self.results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group.config.name.clone(), artifact);

        info!(
            group = name,
            urls = url_count,
            bytes = size,
            duration = ?start.elapsed(),
            "group refreshed"
        );
    }
}

/// Merge fetched tokens into the group artifact: sort byte-wise ascending,
/// join with LF, optionally base64-encode the whole blob.
fn merge_tokens(mut tokens: Vec<String>, encoded: bool) -> Bytes {
    if tokens.is_empty() {
        return Bytes::new();
    }

    tokens.sort_unstable();
    let joined = tokens.join("\n");

    if encoded {
        Bytes::from(STANDARD.encode(joined.as_bytes()).into_bytes())
    } else {
        Bytes::from(joined.into_bytes())
    }
}
