//! Background work manager that processes every member of one entity set.

use std::sync::Arc;

use crate::background::{
    BackgroundWorkManagerWithRetry, EntitySet, IntervalSource, RetryRequest,
};
use crate::failover::FailoverUnitId;
use crate::utils::FailoverError;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;

/// Produces the work for one set member; usually enqueues a job item and
/// waits for its completion.
pub type EntityJobFactory =
    Arc<dyn Fn(FailoverUnitId) -> BoxFuture<'static, Result<(), FailoverError>> + Send + Sync>;

/// Binds a `BackgroundWorkManagerWithRetry` to an `EntitySet`. Each cycle
/// runs one job per member of a snapshot of the set, and asks for a timer
/// retry while the set is non-empty.
#[derive(Debug)]
pub struct MultipleEntityBackgroundWorkManager {
    set: Arc<EntitySet>,
    work: Arc<BackgroundWorkManagerWithRetry>,
}

impl MultipleEntityBackgroundWorkManager {
    pub fn new(
        set: Arc<EntitySet>,
        factory: EntityJobFactory,
        retry_interval: IntervalSource,
        min_interval: IntervalSource,
    ) -> Arc<Self> {
        let name = format!("{}", set.name());
        let set_ref = set.clone();
        let work = BackgroundWorkManagerWithRetry::new(
            name,
            Box::new(move || {
                let set = set_ref.clone();
                let factory = factory.clone();
                async move { Self::run_cycle(set, factory).await }.boxed()
            }),
            retry_interval,
            min_interval,
        );
        set.attach_retry_timer(work.retry_timer().clone());
        Arc::new(MultipleEntityBackgroundWorkManager { set, work })
    }

    async fn run_cycle(set: Arc<EntitySet>, factory: EntityJobFactory) -> RetryRequest {
        let ids = set.get_entities();
        if ids.is_empty() {
            return RetryRequest::None;
        }

        pf_trace!(set.name(); "processing {} entities", ids.len());
        let results = join_all(ids.iter().map(|id| factory(*id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                pf_debug!(set.name(); "job for {} failed: {}", id, e);
            }
        }

        RetryRequest::from(!set.is_empty())
    }

    pub fn set(&self) -> &Arc<EntitySet> {
        &self.set
    }

    pub fn work(&self) -> &Arc<BackgroundWorkManagerWithRetry> {
        &self.work
    }

    /// Runs a cycle now instead of waiting for the retry timer.
    pub fn request(&self) {
        self.work.request();
    }

    pub fn close(&self) {
        self.work.close();
    }
}
