//! Control-plane API surface: connection metadata and ephemeral certificates.

// std
use std::net::IpAddr;
// crates.io
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::{_prelude::*, uri::InstanceUri};

/// Default control-plane endpoint.
pub const DEFAULT_ADMIN_ENDPOINT: &str = "https://dbadmin.cloudapis.dev/";

/// Lifetime requested for ephemeral certificates.
const CERT_DURATION: &str = "3600s";
/// Header carrying the opaque dialer identity on every call.
const DIALER_ID_HEADER: &str = "x-dialer-id";

/// Connection metadata for a single instance.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
	/// Address the instance's server proxy listens on.
	pub ip_address: IpAddr,
	/// Stable unique identifier of the instance.
	#[serde(default)]
	pub instance_uid: String,
}

/// Signed ephemeral certificate material for one refresh.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateBundle {
	/// PEM certificate chain, leaf first.
	pub pem_certificate_chain: Vec<String>,
	/// PEM root certificate the server presents.
	pub ca_cert: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateCertificateRequest<'a> {
	public_key: &'a str,
	cert_duration: &'a str,
}

/// Client-side view of the control plane.
///
/// The two operations together form one logical refresh; callers treat the
/// split as an implementation detail. `dialer_id` is an opaque string the
/// control plane receives with every call.
#[async_trait]
pub trait AdminApi: Send + Sync {
	/// Fetch connection metadata for the instance.
	async fn connection_metadata(
		&self,
		uri: &InstanceUri,
		dialer_id: &str,
	) -> Result<ConnectionMetadata>;

	/// Have the control plane sign the supplied public key into a short-lived
	/// client certificate for the instance's cluster.
	async fn generate_client_certificate(
		&self,
		uri: &InstanceUri,
		public_key_pem: &str,
		dialer_id: &str,
	) -> Result<CertificateBundle>;
}

/// Supplies bearer tokens for control-plane requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
	/// Return a currently-valid bearer token.
	async fn token(&self) -> Result<String>;
}

/// Token source returning a fixed token.
#[derive(Clone, Debug)]
pub struct StaticTokenSource {
	token: String,
}
impl StaticTokenSource {
	/// Wrap a pre-issued token.
	pub fn new(token: impl Into<String>) -> Self {
		Self { token: token.into() }
	}
}
#[async_trait]
impl TokenSource for StaticTokenSource {
	async fn token(&self) -> Result<String> {
		Ok(self.token.clone())
	}
}

/// REST implementation of [`AdminApi`].
pub struct RestAdminClient {
	http: Client,
	endpoint: Url,
	token_source: Arc<dyn TokenSource>,
}
impl RestAdminClient {
	/// Build a client against the given endpoint.
	pub fn new(
		endpoint: impl AsRef<str>,
		token_source: Arc<dyn TokenSource>,
		user_agent: &str,
	) -> Result<Self> {
		let endpoint = Url::parse(endpoint.as_ref())?;
		let http = Client::builder()
			.user_agent(user_agent)
			.connect_timeout(Duration::from_secs(5))
			.build()?;

		Ok(Self { http, endpoint, token_source })
	}

	async fn authorize(&self, builder: RequestBuilder, dialer_id: &str) -> Result<RequestBuilder> {
		let token = self.token_source.token().await?;

		Ok(builder.bearer_auth(token).header(DIALER_ID_HEADER, dialer_id))
	}

	fn resource_url(&self, path: &str) -> Result<Url> {
		Ok(self.endpoint.join(path)?)
	}
}
#[async_trait]
impl AdminApi for RestAdminClient {
	async fn connection_metadata(
		&self,
		uri: &InstanceUri,
		dialer_id: &str,
	) -> Result<ConnectionMetadata> {
		let url = self.resource_url(&format!(
			"v1beta/projects/{}/locations/{}/clusters/{}/instances/{}/connectionInfo",
			uri.project(),
			uri.region(),
			uri.cluster(),
			uri.name(),
		))?;
		let request = self.authorize(self.http.get(url), dialer_id).await?;
		let response = request.send().await.map_err(|err| Error::refresh(uri, err))?;
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();

			return Err(Error::refresh(
				uri,
				format_args!("control plane returned {status} fetching connection info: {body}"),
			));
		}

		response.json().await.map_err(|err| Error::refresh(uri, err))
	}

	async fn generate_client_certificate(
		&self,
		uri: &InstanceUri,
		public_key_pem: &str,
		dialer_id: &str,
	) -> Result<CertificateBundle> {
		let url = self.resource_url(&format!(
			"v1beta/projects/{}/locations/{}/clusters/{}:generateClientCertificate",
			uri.project(),
			uri.region(),
			uri.cluster(),
		))?;
		let body = GenerateCertificateRequest {
			public_key: public_key_pem,
			cert_duration: CERT_DURATION,
		};
		let request = self.authorize(self.http.post(url).json(&body), dialer_id).await?;
		let response = request.send().await.map_err(|err| Error::refresh(uri, err))?;
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();

			return Err(Error::refresh(
				uri,
				format_args!("control plane returned {status} signing certificate: {body}"),
			));
		}

		response.json().await.map_err(|err| Error::refresh(uri, err))
	}
}
