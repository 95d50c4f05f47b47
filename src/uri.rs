//! Logical instance addresses and their parser.

// std
use std::{
	fmt::{Display, Formatter, Result as FmtResult},
	sync::LazyLock,
};
// crates.io
use regex::Regex;
// self
use crate::{Error, Result};

// Instance URIs look like
// `projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE>`,
// optionally with a leading slash. Legacy "domain-scoped" projects
// (e.g. `example.com:project`) are also accepted.
static URI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new("projects/([^:]+(:[^:]+)?)/locations/([^:]+)/clusters/([^:]+)/instances/([^:]+)")
		.expect("instance URI pattern is valid")
});

const PARSE_FAILURE: &str = "invalid instance URI, expected \
	projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE>";

/// Logical address of a managed database instance.
///
/// The canonical string form is `project/region/cluster/instance`; equality
/// is field-wise, which makes the URI usable as a registry key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceUri {
	project: String,
	region: String,
	cluster: String,
	name: String,
}
impl InstanceUri {
	/// Parse a logical instance URI.
	///
	/// The match is a search, not anchored, so a leading slash is permitted.
	/// On mismatch the offending input is carried in the returned error.
	pub fn parse(input: &str) -> Result<Self> {
		let captures = URI_PATTERN.captures(input).ok_or_else(|| Error::Config {
			message: PARSE_FAILURE.into(),
			input: input.into(),
		})?;

		Ok(Self {
			project: captures[1].into(),
			region: captures[3].into(),
			cluster: captures[4].into(),
			name: captures[5].into(),
		})
	}

	/// Project the instance belongs to; may be a legacy domain-scoped
	/// identifier containing one colon.
	pub fn project(&self) -> &str {
		&self.project
	}

	/// Region hosting the cluster.
	pub fn region(&self) -> &str {
		&self.region
	}

	/// Cluster the instance belongs to.
	pub fn cluster(&self) -> &str {
		&self.cluster
	}

	/// Instance name within the cluster.
	pub fn name(&self) -> &str {
		&self.name
	}
}
impl Display for InstanceUri {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		write!(f, "{}/{}/{}/{}", self.project, self.region, self.cluster, self.name)
	}
}
