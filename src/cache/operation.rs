//! A single scheduled refresh attempt and its schedule arithmetic.

// std
use std::{
	net::IpAddr,
	sync::{
		OnceLock,
		atomic::{AtomicBool, Ordering},
	},
};
// crates.io
use rustls::ClientConfig;
use tokio::sync::watch;
// self
use crate::_prelude::*;

/// Safety margin before certificate expiry by which the next refresh must
/// have completed.
pub(crate) const REFRESH_BUFFER: Duration = Duration::from_secs(4 * 60);

/// Connection material produced by one successful refresh.
#[derive(Clone, Debug)]
pub struct RefreshResult {
	/// Address of the instance's server proxy.
	pub ip_address: IpAddr,
	/// TLS client configuration carrying the signed ephemeral certificate,
	/// the client's private key, and the server's root of trust.
	pub tls: Arc<ClientConfig>,
	/// Expiry of the leaf certificate inside [`Self::tls`].
	pub expiry: DateTime<Utc>,
}

/// One scheduled attempt to obtain fresh connection info.
///
/// The ready channel broadcasts completion exactly once, after the outcome
/// has been stored. `claimed` arbitrates the race between the firing timer
/// and [`RefreshOperation::cancel`]: whichever claims first decides whether
/// the refresh body runs.
#[derive(Debug)]
pub(crate) struct RefreshOperation {
	ready: watch::Sender<bool>,
	outcome: OnceLock<Result<RefreshResult>>,
	claimed: AtomicBool,
}
impl RefreshOperation {
	pub(crate) fn new() -> Self {
		let (ready, _) = watch::channel(false);

		Self { ready, outcome: OnceLock::new(), claimed: AtomicBool::new(false) }
	}

	/// Claim the operation for execution when its timer fires. Returns false
	/// when a cancel won the race; the refresh body must not run and the
	/// ready channel will never be signaled.
	pub(crate) fn begin(&self) -> bool {
		self.claim()
	}

	/// Prevent the attempt from starting if it has not already. Returns true
	/// iff the timer was stopped before firing; later calls return false and
	/// have no effect.
	pub(crate) fn cancel(&self) -> bool {
		self.claim()
	}

	fn claim(&self) -> bool {
		!self.claimed.swap(true, Ordering::AcqRel)
	}

	/// Store the outcome and wake every waiter.
	pub(crate) fn complete(&self, outcome: Result<RefreshResult>) {
		if self.outcome.set(outcome).is_ok() {
			self.ready.send_replace(true);
		}
	}

	/// Subscribe to the completion signal.
	pub(crate) fn ready(&self) -> watch::Receiver<bool> {
		self.ready.subscribe()
	}

	/// Outcome of the attempt, if it has terminated.
	pub(crate) fn outcome(&self) -> Option<&Result<RefreshResult>> {
		self.outcome.get()
	}

	/// Non-blocking check: completed, successful, and not yet expired.
	pub(crate) fn is_valid(&self) -> bool {
		matches!(self.outcome.get(), Some(Ok(result)) if Utc::now() < result.expiry)
	}
}

/// Delay before the refresh that should follow a certificate expiring at
/// `expiry`.
///
/// Usually the midpoint of the validity window, which spreads refresh load
/// across the certificate lifetime. A window shorter than an hour signals an
/// anomalous certificate: refresh [`REFRESH_BUFFER`] before expiry, or
/// immediately once inside that buffer.
pub(crate) fn refresh_duration(now: DateTime<Utc>, expiry: DateTime<Utc>) -> Duration {
	let Ok(remaining) = (expiry - now).to_std() else {
		return Duration::ZERO;
	};

	if remaining < Duration::from_secs(60 * 60) {
		if remaining < REFRESH_BUFFER {
			return Duration::ZERO;
		}

		return remaining - REFRESH_BUFFER;
	}

	remaining / 2
}
