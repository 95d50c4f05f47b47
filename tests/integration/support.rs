//! Fakes shared by the integration scenarios: a control plane that signs
//! real certificates on a script, and an in-process TLS server proxy that
//! echoes the instance name.

// std
use std::{
	io,
	net::{IpAddr, SocketAddr},
	sync::{
		Arc, Mutex, OnceLock,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use async_trait::async_trait;
use futures::future::BoxFuture;
use instance_connector::{
	AdminApi, CertificateBundle, ClientKey, ConnectionMetadata, DialFunc, Error, InstanceUri,
	Result,
};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rsa::{RsaPrivateKey, pkcs8::EncodePrivateKey};
use rustls::{
	RootCertStore, ServerConfig,
	pki_types::{CertificateDer, PrivatePkcs8KeyDer},
	server::WebPkiClientVerifier,
};
use time::{Duration as CertDuration, OffsetDateTime};
use tokio::{
	io::AsyncWriteExt,
	net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;

static SHARED_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

/// One RSA key for the whole test binary; generation is slow.
pub fn shared_rsa_key() -> &'static RsaPrivateKey {
	SHARED_KEY.get_or_init(|| {
		RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("rsa key generation")
	})
}

pub fn shared_client_key() -> ClientKey {
	ClientKey::from_private_key(shared_rsa_key()).expect("client key")
}

fn shared_rcgen_key() -> KeyPair {
	let der = shared_rsa_key().to_pkcs8_der().expect("pkcs8");

	KeyPair::try_from(der.as_bytes()).expect("rcgen key pair")
}

/// Per-call behavior of the fake certificate signing endpoint.
#[derive(Clone, Copy, Debug)]
pub enum CertBehavior {
	/// Sign a certificate valid for this many seconds from now; negative
	/// values produce an already-expired leaf.
	ValidFor(i64),
	/// Reject the call.
	Fail,
}

/// Self-signed root plus issuance helpers.
pub struct TestCa {
	key: KeyPair,
	certificate: Certificate,
	pem: String,
}
impl TestCa {
	pub fn new() -> Self {
		let key = KeyPair::generate().expect("ca key");
		let mut params = CertificateParams::default();

		params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

		let mut dn = DistinguishedName::new();

		dn.push(DnType::CommonName, "connector test root");

		params.distinguished_name = dn;

		let certificate = params.self_signed(&key).expect("ca certificate");
		let pem = certificate.pem();

		Self { key, certificate, pem }
	}

	fn issue_client_bundle(&self, validity_seconds: i64) -> CertificateBundle {
		let client_key = shared_rcgen_key();
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();

		dn.push(DnType::CommonName, "connector client");

		params.distinguished_name = dn;
		params.not_before = OffsetDateTime::now_utc() - CertDuration::hours(24);
		params.not_after = OffsetDateTime::now_utc() + CertDuration::seconds(validity_seconds);

		let certificate = params
			.signed_by(&client_key, &self.certificate, &self.key)
			.expect("client certificate");

		CertificateBundle {
			pem_certificate_chain: vec![certificate.pem(), self.pem.clone()],
			ca_cert: self.pem.clone(),
		}
	}

	fn server_config(&self, ip: IpAddr) -> Arc<ServerConfig> {
		let key = KeyPair::generate().expect("server key");
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();

		dn.push(DnType::CommonName, "server proxy");

		params.distinguished_name = dn;
		params.subject_alt_names.push(SanType::IpAddress(ip));
		params.not_after = OffsetDateTime::now_utc() + CertDuration::hours(1);

		let certificate =
			params.signed_by(&key, &self.certificate, &self.key).expect("server certificate");
		let chain: Vec<CertificateDer<'static>> =
			vec![certificate.der().clone(), self.certificate.der().clone()];
		let mut roots = RootCertStore::empty();

		roots.add(self.certificate.der().clone()).expect("ca root");

		// The proxy demands a client certificate, so a handshake only
		// succeeds when the control-plane-signed chain actually works.
		let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build().expect("verifier");
		let config = ServerConfig::builder()
			.with_client_cert_verifier(verifier)
			.with_single_cert(chain, PrivatePkcs8KeyDer::from(key.serialize_der()).into())
			.expect("server config");

		Arc::new(config)
	}
}

/// Control plane double: signs the dialer's RSA key into real certificates
/// following a per-call script.
pub struct FakeControlPlane {
	ca: TestCa,
	ip: IpAddr,
	fail_metadata: bool,
	metadata_delay: Option<Duration>,
	script: Mutex<Vec<CertBehavior>>,
	fallback: CertBehavior,
	metadata_calls: AtomicUsize,
	certificate_calls: AtomicUsize,
}
impl FakeControlPlane {
	/// Always signs hour-long certificates.
	pub fn healthy() -> Arc<Self> {
		Self::scripted(Vec::new(), CertBehavior::ValidFor(3_600))
	}

	/// Every metadata call fails, as for a nonexistent instance.
	pub fn failing() -> Arc<Self> {
		let mut plane = Self::inner(Vec::new(), CertBehavior::Fail);

		plane.fail_metadata = true;

		Arc::new(plane)
	}

	/// Healthy, but metadata calls stall for `delay` first.
	pub fn slow(delay: Duration) -> Arc<Self> {
		let mut plane = Self::inner(Vec::new(), CertBehavior::ValidFor(3_600));

		plane.metadata_delay = Some(delay);

		Arc::new(plane)
	}

	/// Consume `script` one call at a time, then fall back to `fallback`.
	pub fn scripted(script: Vec<CertBehavior>, fallback: CertBehavior) -> Arc<Self> {
		Arc::new(Self::inner(script, fallback))
	}

	fn inner(script: Vec<CertBehavior>, fallback: CertBehavior) -> Self {
		Self {
			ca: TestCa::new(),
			ip: [127, 0, 0, 1].into(),
			fail_metadata: false,
			metadata_delay: None,
			script: Mutex::new(script),
			fallback,
			metadata_calls: AtomicUsize::new(0),
			certificate_calls: AtomicUsize::new(0),
		}
	}

	pub fn metadata_calls(&self) -> usize {
		self.metadata_calls.load(Ordering::SeqCst)
	}

	pub fn certificate_calls(&self) -> usize {
		self.certificate_calls.load(Ordering::SeqCst)
	}

	/// TLS acceptor configuration for a proxy presenting this plane's CA.
	pub fn server_config(&self) -> Arc<ServerConfig> {
		self.ca.server_config(self.ip)
	}

	/// A pre-issued bundle, for REST fixtures serving static bodies.
	pub fn issue_client_bundle(&self, validity_seconds: i64) -> CertificateBundle {
		self.ca.issue_client_bundle(validity_seconds)
	}
}
#[async_trait]
impl AdminApi for FakeControlPlane {
	async fn connection_metadata(
		&self,
		uri: &InstanceUri,
		_dialer_id: &str,
	) -> Result<ConnectionMetadata> {
		self.metadata_calls.fetch_add(1, Ordering::SeqCst);

		if let Some(delay) = self.metadata_delay {
			tokio::time::sleep(delay).await;
		}
		if self.fail_metadata {
			return Err(Error::Refresh {
				uri: uri.to_string(),
				reason: "instance does not exist".into(),
			});
		}

		Ok(ConnectionMetadata { ip_address: self.ip, instance_uid: "test-uid".into() })
	}

	async fn generate_client_certificate(
		&self,
		uri: &InstanceUri,
		_public_key_pem: &str,
		_dialer_id: &str,
	) -> Result<CertificateBundle> {
		self.certificate_calls.fetch_add(1, Ordering::SeqCst);

		let behavior = {
			let mut script = self.script.lock().expect("script lock");

			if script.is_empty() { self.fallback } else { script.remove(0) }
		};

		match behavior {
			CertBehavior::ValidFor(seconds) => Ok(self.ca.issue_client_bundle(seconds)),
			CertBehavior::Fail => Err(Error::Refresh {
				uri: uri.to_string(),
				reason: "certificate signing rejected".into(),
			}),
		}
	}
}

/// Start a TLS listener that writes `instance_name` into every accepted
/// connection and closes it, mirroring the real server proxy handshake path.
pub async fn start_server_proxy(instance_name: &'static str, config: Arc<ServerConfig>) -> SocketAddr {
	let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind proxy");
	let address = listener.local_addr().expect("proxy address");

	tokio::spawn(async move {
		loop {
			let Ok((socket, _)) = listener.accept().await else {
				break;
			};
			let acceptor = TlsAcceptor::from(config.clone());

			tokio::spawn(async move {
				if let Ok(mut stream) = acceptor.accept(socket).await {
					let _ = stream.write_all(instance_name.as_bytes()).await;
					let _ = stream.shutdown().await;
				}
			});
		}
	});

	address
}

/// Dial function routing every connection to `address`, standing in for the
/// fixed server-proxy port.
pub fn dial_func_to(address: SocketAddr) -> DialFunc {
	Arc::new(move |_| -> BoxFuture<'static, io::Result<TcpStream>> {
		Box::pin(async move { TcpStream::connect(address).await })
	})
}

/// Dial function that always fails with `message`.
pub fn failing_dial_func(message: &'static str) -> DialFunc {
	Arc::new(move |_| -> BoxFuture<'static, io::Result<TcpStream>> {
		Box::pin(async move { Err(io::Error::other(message)) })
	})
}
