//! Execution of one control-plane refresh: API calls in, TLS material out.

// crates.io
use rustls::{ClientConfig, RootCertStore, pki_types::CertificateDer};
use tracing::debug;
use x509_parser::parse_x509_certificate;
// self
use crate::{
	_prelude::*,
	admin::AdminApi,
	cache::operation::RefreshResult,
	keys::ClientKey,
	uri::InstanceUri,
};

/// Performs the control-plane exchange backing every refresh.
///
/// One refresher is shared by all of a dialer's caches; it carries the
/// dialer's key material and opaque identity.
#[derive(Clone)]
pub(crate) struct Refresher {
	api: Arc<dyn AdminApi>,
	key: ClientKey,
	dialer_id: Arc<str>,
}
impl Refresher {
	pub(crate) fn new(api: Arc<dyn AdminApi>, key: ClientKey, dialer_id: impl Into<Arc<str>>) -> Self {
		Self { api, key, dialer_id: dialer_id.into() }
	}

	/// One full refresh: metadata fetch, certificate signing, TLS assembly.
	///
	/// Certificate-material failures are reported as refresh errors citing
	/// the instance URI; API failures keep whatever category the admin client
	/// assigned them.
	pub(crate) async fn perform(&self, uri: &InstanceUri) -> Result<RefreshResult> {
		let metadata = self.api.connection_metadata(uri, &self.dialer_id).await?;
		let bundle = self
			.api
			.generate_client_certificate(uri, self.key.public_key_pem(), &self.dialer_id)
			.await?;
		let chain = decode_pem_chain(&bundle.pem_certificate_chain)
			.map_err(|reason| Error::refresh(uri, reason))?;
		let expiry = leaf_expiry(&chain[0]).map_err(|reason| Error::refresh(uri, reason))?;
		let roots = root_store(&bundle.ca_cert).map_err(|reason| Error::refresh(uri, reason))?;
		let tls = ClientConfig::builder()
			.with_root_certificates(roots)
			.with_client_auth_cert(chain, self.key.private_key_der())
			.map_err(|err| Error::refresh(uri, err))?;

		debug!(instance = %uri, ip = %metadata.ip_address, expiry = %expiry, "refreshed connection info");

		Ok(RefreshResult { ip_address: metadata.ip_address, tls: Arc::new(tls), expiry })
	}
}

/// Decode a PEM chain into DER certificates, leaf first.
fn decode_pem_chain(pems: &[String]) -> std::result::Result<Vec<CertificateDer<'static>>, String> {
	let mut chain = Vec::with_capacity(pems.len());

	for pem in pems {
		for certificate in rustls_pemfile::certs(&mut pem.as_bytes()) {
			chain.push(certificate.map_err(|err| format!("invalid certificate chain: {err}"))?);
		}
	}

	if chain.is_empty() {
		return Err("control plane returned an empty certificate chain".into());
	}

	Ok(chain)
}

/// `NotAfter` of the leaf certificate.
fn leaf_expiry(leaf: &CertificateDer<'_>) -> std::result::Result<DateTime<Utc>, String> {
	let (_, certificate) = parse_x509_certificate(leaf)
		.map_err(|err| format!("failed to parse leaf certificate: {err}"))?;
	let timestamp = certificate.validity().not_after.timestamp();

	DateTime::from_timestamp(timestamp, 0)
		.ok_or_else(|| "leaf certificate carries an unrepresentable expiry".into())
}

/// Root store trusting the server CA the control plane returned.
fn root_store(ca_pem: &str) -> std::result::Result<RootCertStore, String> {
	let mut roots = RootCertStore::empty();

	for certificate in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
		let certificate = certificate.map_err(|err| format!("invalid server root: {err}"))?;

		roots.add(certificate).map_err(|err| format!("unusable server root: {err}"))?;
	}

	if roots.is_empty() {
		return Err("control plane returned no server root certificate".into());
	}

	Ok(roots)
}
