//! Client key material shared by every cache a dialer owns.

// crates.io
use rsa::{
	RsaPrivateKey,
	pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
// self
use crate::_prelude::*;

/// Bit size of generated client keys.
const KEY_BITS: usize = 2048;

/// RSA key pair held for the lifetime of a dialer.
///
/// The control plane signs the public half into each ephemeral certificate;
/// the private half becomes the TLS client-auth key. Both encodings are
/// precomputed so refresh cycles never re-serialize the key.
#[derive(Clone, Debug)]
pub struct ClientKey {
	pkcs8_der: Arc<[u8]>,
	public_key_pem: Arc<str>,
}
impl ClientKey {
	/// Generate a fresh 2048-bit RSA key.
	pub fn generate() -> Result<Self> {
		let key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)?;

		Self::from_private_key(&key)
	}

	/// Wrap an existing RSA private key.
	pub fn from_private_key(key: &RsaPrivateKey) -> Result<Self> {
		let pkcs8_der = key.to_pkcs8_der()?.as_bytes().to_vec().into();
		let public_key_pem = key.to_public_key().to_public_key_pem(LineEnding::LF)?.into();

		Ok(Self { pkcs8_der, public_key_pem })
	}

	/// PEM-encoded SPKI public key forwarded with certificate signing
	/// requests.
	pub fn public_key_pem(&self) -> &str {
		&self.public_key_pem
	}

	/// PKCS#8 DER private key for the TLS client configuration.
	pub(crate) fn private_key_der(&self) -> PrivateKeyDer<'static> {
		PrivatePkcs8KeyDer::from(self.pkcs8_der.to_vec()).into()
	}
}
