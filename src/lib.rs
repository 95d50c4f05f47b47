//! Async connector for managed cloud database instances — per-instance
//! certificate caches with proactive refresh, and a dialer producing
//! mutually-authenticated TLS streams from logical instance URIs.
//!
//! Instances are addressed as
//! `projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE>`.
//! The first dial to an instance fetches connection metadata and a
//! control-plane-signed ephemeral certificate; a background chain then renews
//! the certificate well before expiry so subsequent dials never wait on the
//! control plane.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod admin;
pub mod cache;
pub mod dialer;
pub mod keys;
pub mod uri;

mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, Utc};

	pub use crate::{Error, Result};
}
pub use crate::{
	admin::{
		AdminApi, CertificateBundle, ConnectionMetadata, RestAdminClient, StaticTokenSource,
		TokenSource,
	},
	cache::{
		instance::{DEFAULT_REFRESH_TIMEOUT, InstanceCache},
		operation::RefreshResult,
	},
	dialer::{DialFunc, DialOpts, Dialer, DialerBuilder, InstanceStream, SERVER_PROXY_PORT},
	error::{Error, Result},
	keys::ClientKey,
	uri::InstanceUri,
};
