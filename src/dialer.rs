//! Registry of instance caches and the public dial surface.

// std
use std::{collections::HashMap, io, net::SocketAddr};
// crates.io
use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use tokio::{net::TcpStream, sync::RwLock};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::warn;
use uuid::Uuid;
// self
use crate::{
	_prelude::*,
	admin::{AdminApi, DEFAULT_ADMIN_ENDPOINT, RestAdminClient, TokenSource},
	cache::{
		instance::{DEFAULT_REFRESH_TIMEOUT, InstanceCache},
		refresher::Refresher,
	},
	keys::ClientKey,
	uri::InstanceUri,
};

/// Port the instance-side server proxy listens on.
pub const SERVER_PROXY_PORT: u16 = 5433;

const DEFAULT_USER_AGENT: &str = concat!("instance-connector/", env!("CARGO_PKG_VERSION"));

/// Transport-level dial function producing the raw socket TLS runs over.
pub type DialFunc = Arc<dyn Fn(SocketAddr) -> BoxFuture<'static, io::Result<TcpStream>> + Send + Sync>;

/// Authenticated stream returned by [`Dialer::dial`].
pub type InstanceStream = TlsStream<TcpStream>;

/// Per-call dial options.
#[derive(Clone, Default)]
pub struct DialOpts {
	one_off_dial_func: Option<DialFunc>,
}
impl DialOpts {
	/// Override the transport dial function for this call only.
	pub fn one_off_dial_func(mut self, dial_func: DialFunc) -> Self {
		self.one_off_dial_func = Some(dial_func);

		self
	}
}

/// Builder for [`Dialer`].
#[derive(Default)]
pub struct DialerBuilder {
	token_source: Option<Arc<dyn TokenSource>>,
	admin_endpoint: Option<String>,
	admin_api: Option<Arc<dyn AdminApi>>,
	client_key: Option<ClientKey>,
	refresh_timeout: Option<Duration>,
	dial_func: Option<DialFunc>,
	user_agent: Option<String>,
}
impl DialerBuilder {
	/// Create a builder with default configuration.
	pub fn new() -> Self {
		Self::default()
	}

	/// Credentials for the control-plane client.
	pub fn token_source(mut self, token_source: Arc<dyn TokenSource>) -> Self {
		self.token_source = Some(token_source);

		self
	}

	/// Override the control-plane endpoint.
	pub fn admin_endpoint(mut self, endpoint: impl Into<String>) -> Self {
		self.admin_endpoint = Some(endpoint.into());

		self
	}

	/// Use a custom control-plane client; `token_source`, `admin_endpoint`
	/// and `user_agent` are ignored when one is supplied.
	pub fn admin_api(mut self, api: Arc<dyn AdminApi>) -> Self {
		self.admin_api = Some(api);

		self
	}

	/// Use an existing RSA key instead of generating one.
	pub fn client_key(mut self, key: ClientKey) -> Self {
		self.client_key = Some(key);

		self
	}

	/// Deadline for each refresh attempt
	/// (default [`DEFAULT_REFRESH_TIMEOUT`]).
	pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
		self.refresh_timeout = Some(timeout);

		self
	}

	/// Transport dial used for every connection (default: TCP).
	pub fn dial_func(mut self, dial_func: DialFunc) -> Self {
		self.dial_func = Some(dial_func);

		self
	}

	/// Opaque string prepended to the user agent on control-plane calls.
	pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.user_agent = Some(user_agent.into());

		self
	}

	/// Finalize the configuration and construct a [`Dialer`].
	pub fn build(self) -> Result<Dialer> {
		let key = match self.client_key {
			Some(key) => key,
			None => ClientKey::generate()?,
		};
		let admin: Arc<dyn AdminApi> = match self.admin_api {
			Some(api) => api,
			None => {
				let token_source = self.token_source.ok_or_else(|| Error::Config {
					message: "a token source is required to reach the control plane".into(),
					input: "token_source".into(),
				})?;
				let user_agent = match &self.user_agent {
					Some(prefix) => format!("{prefix} {DEFAULT_USER_AGENT}"),
					None => DEFAULT_USER_AGENT.into(),
				};
				let endpoint = self.admin_endpoint.as_deref().unwrap_or(DEFAULT_ADMIN_ENDPOINT);

				Arc::new(RestAdminClient::new(endpoint, token_source, &user_agent)?)
			},
		};
		let dialer_id = Uuid::new_v4().to_string();

		Ok(Dialer {
			instances: RwLock::new(HashMap::new()),
			refresher: Refresher::new(admin, key, dialer_id),
			refresh_timeout: self.refresh_timeout.unwrap_or(DEFAULT_REFRESH_TIMEOUT),
			dial_func: self.dial_func.unwrap_or_else(default_dial_func),
		})
	}
}

/// Dials managed database instances by logical URI over mutually
/// authenticated TLS.
///
/// The dialer owns one [`InstanceCache`] per instance it has seen; each cache
/// keeps a fresh ephemeral certificate on hand so dialing never waits on the
/// control plane once the instance is warm. Caches whose refreshes fail are
/// evicted and closed so a nonexistent instance cannot leak a background
/// refresh chain.
pub struct Dialer {
	instances: RwLock<HashMap<InstanceUri, InstanceCache>>,
	refresher: Refresher,
	refresh_timeout: Duration,
	dial_func: DialFunc,
}
impl std::fmt::Debug for Dialer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Dialer")
			.field("refresh_timeout", &self.refresh_timeout)
			.finish_non_exhaustive()
	}
}
impl Dialer {
	/// Start building a dialer.
	pub fn builder() -> DialerBuilder {
		DialerBuilder::new()
	}

	/// Open an authenticated stream to the instance named by `instance_uri`.
	pub async fn dial(&self, instance_uri: &str) -> Result<InstanceStream> {
		self.dial_with(instance_uri, DialOpts::default()).await
	}

	/// [`Dialer::dial`] with per-call options.
	#[tracing::instrument(skip(self, opts))]
	pub async fn dial_with(&self, instance_uri: &str, opts: DialOpts) -> Result<InstanceStream> {
		let uri = InstanceUri::parse(instance_uri)?;
		let cache = self.cache_for(&uri).await;
		let mut info = match cache.connect_info().await {
			Ok(info) => info,
			Err(err) => return Err(self.evict(&uri, as_refresh_error(&uri, err)).await),
		};

		// A leaf that expired while cached cannot complete a handshake;
		// refresh before burning a connection attempt on it.
		if info.expiry <= Utc::now() {
			warn!(instance = %uri, expiry = %info.expiry, "cached certificate already expired, forcing refresh");
			cache.force_refresh().await;

			info = match cache.connect_info().await {
				Ok(info) => info,
				Err(err) => return Err(self.evict(&uri, as_refresh_error(&uri, err)).await),
			};
		}

		let address = SocketAddr::new(info.ip_address, SERVER_PROXY_PORT);
		let dial_func = opts.one_off_dial_func.as_ref().unwrap_or(&self.dial_func);
		let socket = match dial_func(address).await {
			Ok(socket) => socket,
			Err(err) => return Err(self.evict(&uri, Error::dial(&uri, err)).await),
		};
		let connector = TlsConnector::from(info.tls.clone());
		let server_name = ServerName::IpAddress(info.ip_address.into());

		match connector.connect(server_name, socket).await {
			Ok(stream) => Ok(stream),
			Err(err) => {
				// A handshake failing right at expiry means the cache served
				// a stale certificate; make the follow-up refresh immediate.
				if info.expiry <= Utc::now() {
					cache.force_refresh().await;
				}

				Err(self.evict(&uri, Error::dial(&uri, err)).await)
			},
		}
	}

	/// Close every cache and clear the registry.
	pub async fn close(&self) {
		let mut instances = self.instances.write().await;

		for (_, cache) in instances.drain() {
			cache.close();
		}
	}

	/// Look up the cache for `uri`, creating and registering one on first
	/// use. Lookups take the read lock; insertion upgrades to the write lock
	/// and re-checks.
	async fn cache_for(&self, uri: &InstanceUri) -> InstanceCache {
		if let Some(cache) = self.instances.read().await.get(uri) {
			return cache.clone();
		}

		let mut instances = self.instances.write().await;

		instances
			.entry(uri.clone())
			.or_insert_with(|| {
				InstanceCache::new(uri.clone(), self.refresher.clone(), self.refresh_timeout)
			})
			.clone()
	}

	/// Remove the cache for `uri` and stop its refresh chain, then hand the
	/// error back for the caller. Concurrent dials holding the evicted cache
	/// simply observe the same failure.
	async fn evict(&self, uri: &InstanceUri, err: Error) -> Error {
		let removed = { self.instances.write().await.remove(uri) };

		if let Some(cache) = removed {
			warn!(instance = %uri, error = %err, "evicting connection info cache");
			cache.close();
		}

		err
	}
}

/// Failures to obtain connection info leave `dial` as refresh errors,
/// whatever shape the cache stored them in; a dial error is reserved for
/// transport and TLS failures with fresh credentials in hand. Caller-side
/// cancellation passes through verbatim.
fn as_refresh_error(uri: &InstanceUri, err: Error) -> Error {
	match err {
		Error::Canceled | Error::Refresh { .. } => err,
		other => Error::refresh(uri, other),
	}
}

fn default_dial_func() -> DialFunc {
	Arc::new(|address: SocketAddr| -> BoxFuture<'static, io::Result<TcpStream>> {
		Box::pin(async move { TcpStream::connect(address).await })
	})
}
