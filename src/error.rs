//! Crate-wide error types and `Result` alias.

// std
use std::sync::Arc;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the connector crate.
///
/// The three user-visible categories are [`Error::Config`] (bad caller
/// input, not retriable), [`Error::Refresh`] (the control-plane interaction
/// failed) and [`Error::Dial`] (the transport-level connection failed despite
/// fresh credentials). Foreign payloads are `Arc`-wrapped so the enum is
/// `Clone`: a refresh operation stores its outcome once and serves it
/// verbatim to every connection attempt that observed it.
#[allow(missing_docs)]
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(Arc<std::io::Error>),

	#[error(transparent)]
	Http(Arc<reqwest::Error>),
	#[error(transparent)]
	Pkcs8(Arc<rsa::pkcs8::Error>),
	#[error(transparent)]
	Rsa(Arc<rsa::errors::Error>),
	#[error(transparent)]
	Spki(Arc<rsa::pkcs8::spki::Error>),
	#[error(transparent)]
	Tls(Arc<rustls::Error>),
	#[error(transparent)]
	Url(Arc<url::ParseError>),

	#[error("{message}: {input}")]
	Config { message: String, input: String },
	#[error("refresh failed for instance {uri}: {reason}")]
	Refresh { uri: String, reason: String },
	#[error("failed to connect to instance {uri}: {reason}")]
	Dial { uri: String, reason: String },
	#[error("operation was canceled")]
	Canceled,
}
impl Error {
	/// Build a [`Error::Refresh`] citing the given instance URI.
	pub(crate) fn refresh(uri: impl ToString, cause: impl std::fmt::Display) -> Self {
		Self::Refresh { uri: uri.to_string(), reason: cause.to_string() }
	}

	/// Build a [`Error::Dial`] citing the given instance URI.
	pub(crate) fn dial(uri: impl ToString, cause: impl std::fmt::Display) -> Self {
		Self::Dial { uri: uri.to_string(), reason: cause.to_string() }
	}
}
impl From<std::io::Error> for Error {
	fn from(value: std::io::Error) -> Self {
		Self::Io(Arc::new(value))
	}
}
impl From<reqwest::Error> for Error {
	fn from(value: reqwest::Error) -> Self {
		Self::Http(Arc::new(value))
	}
}
impl From<rsa::pkcs8::Error> for Error {
	fn from(value: rsa::pkcs8::Error) -> Self {
		Self::Pkcs8(Arc::new(value))
	}
}
impl From<rsa::errors::Error> for Error {
	fn from(value: rsa::errors::Error) -> Self {
		Self::Rsa(Arc::new(value))
	}
}
impl From<rsa::pkcs8::spki::Error> for Error {
	fn from(value: rsa::pkcs8::spki::Error) -> Self {
		Self::Spki(Arc::new(value))
	}
}
impl From<rustls::Error> for Error {
	fn from(value: rustls::Error) -> Self {
		Self::Tls(Arc::new(value))
	}
}
impl From<url::ParseError> for Error {
	fn from(value: url::ParseError) -> Self {
		Self::Url(Arc::new(value))
	}
}
