//! Per-instance connection-info cache and its proactive refresh loop.

// std
use std::{
	num::NonZeroU32,
	sync::Weak,
};
// crates.io
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::{sync::RwLock, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
// self
use crate::{
	_prelude::*,
	cache::{
		operation::{RefreshOperation, RefreshResult, refresh_duration},
		refresher::Refresher,
	},
	uri::InstanceUri,
};

/// Maximum duration a refresh attempt may run, rate-limiter wait included.
/// This value should be greater than the refresh interval.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum spacing between refresh attempts as enforced by the rate limiter.
pub(crate) const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Initial burst allowed by the rate limiter.
pub(crate) const REFRESH_BURST: NonZeroU32 = NonZeroU32::new(2).unwrap();

const LIMITER_WAIT_FAILED: &str = "context was canceled or expired before refresh completed";

/// Cache of connection info for one instance.
///
/// The cache drives a self-scheduling chain of refresh operations against the
/// control plane, renewing the ephemeral certificate well before the previous
/// one expires (for hour-long certificates, at the midpoint of the validity
/// window). Connection attempts observe the `current` operation; `next` is
/// the scheduled or running follow-up that replaces it.
#[derive(Clone)]
pub struct InstanceCache {
	inner: Arc<CacheInner>,
}
impl InstanceCache {
	/// Create the cache and schedule its first refresh immediately.
	///
	/// `current` and `next` start as the same operation so that every
	/// connection attempt blocks until the initial refresh completes.
	pub(crate) fn new(uri: InstanceUri, refresher: Refresher, refresh_timeout: Duration) -> Self {
		let first = Arc::new(RefreshOperation::new());
		let inner = Arc::new(CacheInner {
			uri,
			refresher,
			refresh_timeout,
			limiter: RateLimiter::direct(refresh_quota()),
			operations: RwLock::new(OperationPair {
				current: first.clone(),
				next: first.clone(),
			}),
			shutdown: CancellationToken::new(),
		});

		// Armed only once the cache is fully constructed; the timer task must
		// be able to upgrade its weak reference when it fires.
		arm(Arc::downgrade(&inner), first, Duration::ZERO);

		Self { inner }
	}

	/// Instance this cache serves.
	pub fn uri(&self) -> &InstanceUri {
		&self.inner.uri
	}

	/// Wait for the current refresh result and return it.
	///
	/// The `current` operation is snapshotted under the read lock and awaited
	/// outside it, so connection attempts never block in-flight refreshes.
	/// A completed failure is returned verbatim to every waiter.
	#[tracing::instrument(skip(self), fields(instance = %self.inner.uri))]
	pub async fn connect_info(&self) -> Result<RefreshResult> {
		let operation = { self.inner.operations.read().await.current.clone() };
		let mut ready = operation.ready();

		ready.wait_for(|done| *done).await.map_err(|_| Error::Canceled)?;

		match operation.outcome() {
			Some(outcome) => outcome.clone(),
			None => Err(Error::Canceled),
		}
	}

	/// Schedule an immediate refresh to replace the pending one, and make
	/// future connection attempts block on it when the current result is no
	/// longer usable.
	#[tracing::instrument(skip(self), fields(instance = %self.inner.uri))]
	pub async fn force_refresh(&self) {
		let mut operations = self.inner.operations.write().await;

		// The pending refresh can only be replaced while its timer has not
		// fired; a refresh that already started will reschedule on its own.
		if operations.next.cancel() {
			operations.next = schedule(Arc::downgrade(&self.inner), Duration::ZERO);
		}
		if !operations.current.is_valid() {
			operations.current = operations.next.clone();
		}
	}

	/// Stop the refresh chain.
	///
	/// No new control-plane calls are made; attempts waiting on the rate
	/// limiter fail their wait. Operations whose timer has not yet fired keep
	/// their completion signal open until they fire and observe the
	/// cancellation. Idempotent.
	pub fn close(&self) {
		self.inner.shutdown.cancel();
	}

	#[cfg(test)]
	pub(crate) fn is_closed(&self) -> bool {
		self.inner.shutdown.is_cancelled()
	}

	#[cfg(test)]
	pub(crate) async fn operation_pointers(&self) -> (usize, usize) {
		let operations = self.inner.operations.read().await;

		(
			Arc::as_ptr(&operations.current) as usize,
			Arc::as_ptr(&operations.next) as usize,
		)
	}
}

struct CacheInner {
	uri: InstanceUri,
	refresher: Refresher,
	refresh_timeout: Duration,
	limiter: DefaultDirectRateLimiter,
	operations: RwLock<OperationPair>,
	shutdown: CancellationToken,
}
impl CacheInner {
	/// Refresh body: run the attempt, publish the outcome, then install the
	/// result and the follow-up under the write lock.
	async fn run_refresh(self: &Arc<Self>, operation: Arc<RefreshOperation>) {
		let outcome = self.attempt().await;

		match &outcome {
			Ok(result) => debug!(instance = %self.uri, expiry = %result.expiry, "refresh succeeded"),
			Err(err) => warn!(instance = %self.uri, error = %err, "refresh failed"),
		}

		operation.complete(outcome.clone());

		let mut operations = self.operations.write().await;

		match outcome {
			Err(_) => {
				// A still-valid result keeps serving connections; the failure
				// becomes visible only once nothing usable remains.
				if !operations.current.is_valid() {
					operations.current = operation;
				}
				if self.shutdown.is_cancelled() {
					return;
				}

				// Retry immediately; the rate limiter spaces real attempts.
				operations.next = schedule(Arc::downgrade(self), Duration::ZERO);
			},
			Ok(result) => {
				operations.current = operation;

				if self.shutdown.is_cancelled() {
					return;
				}

				let delay = refresh_duration(Utc::now(), result.expiry);

				debug!(instance = %self.uri, ?delay, "scheduled follow-up refresh");

				operations.next = schedule(Arc::downgrade(self), delay);
			},
		}
	}

	/// One bounded attempt: rate-limiter token, then the control-plane round
	/// trip, both under the refresh timeout and the lifecycle scope.
	async fn attempt(&self) -> Result<RefreshResult> {
		let deadline = time::Instant::now() + self.refresh_timeout;
		let token = time::timeout_at(deadline, async {
			tokio::select! {
				// A canceled scope must win even when a token is available.
				biased;
				_ = self.shutdown.cancelled() => Err(()),
				_ = self.limiter.until_ready() => Ok(()),
			}
		})
		.await;

		if !matches!(token, Ok(Ok(()))) {
			return Err(Error::dial(&self.uri, LIMITER_WAIT_FAILED));
		}

		match time::timeout_at(deadline, self.refresher.perform(&self.uri)).await {
			Ok(outcome) => outcome,
			Err(_) => {
				Err(Error::refresh(&self.uri, "refresh did not complete within the refresh timeout"))
			},
		}
	}
}

struct OperationPair {
	/// Operation connection attempts observe. Equals `next` until the first
	/// refresh completes.
	current: Arc<RefreshOperation>,
	/// Most recently scheduled follow-up.
	next: Arc<RefreshOperation>,
}

fn refresh_quota() -> Quota {
	// One token per interval, with an initial burst.
	Quota::with_period(REFRESH_INTERVAL)
		.expect("refresh interval is nonzero")
		.allow_burst(REFRESH_BURST)
}

/// Schedule a refresh to fire after `delay`.
fn schedule(cache: Weak<CacheInner>, delay: Duration) -> Arc<RefreshOperation> {
	let operation = Arc::new(RefreshOperation::new());

	arm(cache, operation.clone(), delay);

	operation
}

/// Arm the operation's timer.
///
/// The task holds only a weak cache reference: once the cache is dropped, a
/// pending timer expires without running the body. A zero delay fires
/// immediately.
fn arm(cache: Weak<CacheInner>, operation: Arc<RefreshOperation>, delay: Duration) {
	tokio::spawn(async move {
		if !delay.is_zero() {
			time::sleep(delay).await;
		}
		if !operation.begin() {
			// Canceled before firing; the ready channel stays open.
			return;
		}

		let Some(cache) = cache.upgrade() else {
			return;
		};

		cache.run_refresh(operation).await;
	});
}
