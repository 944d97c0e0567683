use super::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub enum Flavor {
    #[display("MySQL")]
    MySQL,
    #[display("MariaDB")]
    MariaDB,
    #[display("Percona")]
    Percona,
}

/// Where global variables and status are read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableSource {
    PerformanceSchema,
    InformationSchema,
}

impl VariableSource {
    pub fn schema(&self) -> &'static str {
        match self {
            Self::PerformanceSchema => "performance_schema",
            Self::InformationSchema => "information_schema",
        }
    }
}

/// What a server can do, derived from its version strings only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub flavor: Flavor,
    pub major: u32,
    pub minor: u32,
    pub variable_source: VariableSource,
    pub supports_multi_source_native: bool,
    /// Set when the endpoint is a MaxScale binlog router.
    pub maxscale_version: Option<String>,
}

impl CapabilityRecord {
    pub fn is_mariadb(&self) -> bool {
        self.flavor == Flavor::MariaDB
    }

    /// MySQL-style `FOR CHANNEL` syntax is available.
    pub fn has_channel_syntax(&self) -> bool {
        !self.is_mariadb() && (self.major, self.minor) >= (5, 7)
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

/// Classify a server from `@@version` and `@@version_comment`.
pub fn probe(version: &str, comment: &str) -> Result<CapabilityRecord> {
    let flavor = if version.contains("MariaDB") || comment.contains("MariaDB") {
        Flavor::MariaDB
    } else if comment.contains("Percona") {
        Flavor::Percona
    } else {
        Flavor::MySQL
    };

    let (major, minor) = parse_major_minor(version)
        .with_context(|| format!("cannot parse server version `{version}`"))?;

    let variable_source = if flavor != Flavor::MariaDB && (major, minor) >= (5, 7) {
        VariableSource::PerformanceSchema
    } else {
        VariableSource::InformationSchema
    };

    let maxscale_version = version
        .split_whitespace()
        .chain(comment.split_whitespace())
        .find(|tok| tok.to_ascii_lowercase().contains("maxscale"))
        .map(|tok| tok.to_owned());

    Ok(CapabilityRecord {
        flavor,
        major,
        minor,
        variable_source,
        supports_multi_source_native: flavor == Flavor::MariaDB,
        maxscale_version,
    })
}

fn parse_major_minor(version: &str) -> Option<(u32, u32)> {
    let mut it = version.trim().split('.');
    let major = leading_number(it.next()?)?;
    let minor = leading_number(it.next()?)?;
    Some((major, minor))
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
