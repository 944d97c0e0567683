//! GTID lists across flavors.
//!
//! MariaDB positions are native `domain-origin-seq` triples. MySQL sets of the
//! form `UUID:low-high` are mapped onto the same triples: domain 0, the origin
//! is the CRC-64 (ECMA-182 polynomial, reflected) of the upper-cased UUID and
//! the sequence is the highest bound.

use super::*;

use std::cmp::Ordering;
use std::collections::BTreeMap;

const CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_XZ);

/// Origin of a MySQL source UUID.
pub fn origin_of_uuid(uuid: &str) -> u64 {
    CRC64.checksum(uuid.trim().to_ascii_uppercase().as_bytes())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub domain: u32,
    pub origin: u64,
    pub seq: u64,
}

impl std::fmt::Display for Gtid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.origin, self.seq)
    }
}

/// Normalized list with at most one entry per `(domain, origin)`, sorted by key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GtidList {
    entries: Vec<Gtid>,
}

impl GtidList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(xs: impl IntoIterator<Item = Gtid>) -> Self {
        let mut m: BTreeMap<(u32, u64), u64> = BTreeMap::new();
        for x in xs {
            let e = m.entry((x.domain, x.origin)).or_insert(x.seq);
            *e = u64::max(*e, x.seq);
        }
        let entries = m
            .into_iter()
            .map(|((domain, origin), seq)| Gtid {
                domain,
                origin,
                seq,
            })
            .collect();
        Self { entries }
    }

    /// Parse either flavor. Whitespace and newlines are ignored.
    pub fn parse(s: &str) -> Result<Self> {
        let mut xs = vec![];
        for tok in s.split(',') {
            let tok: String = tok.chars().filter(|c| !c.is_whitespace()).collect();
            if tok.is_empty() {
                continue;
            }
            if tok.contains(':') {
                xs.push(parse_mysql(&tok)?);
            } else {
                xs.push(parse_mariadb(&tok)?);
            }
        }
        Ok(Self::from_entries(xs))
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gtid> {
        self.entries.iter()
    }

    /// Sequence observed for `(domain, origin)`. Absence is 0.
    pub fn seq_of(&self, domain: u32, origin: u64) -> u64 {
        self.entries
            .binary_search_by(|x| (x.domain, x.origin).cmp(&(domain, origin)))
            .map(|i| self.entries[i].seq)
            .unwrap_or(0)
    }

    /// Highest sequence written by `origin` in any domain.
    pub fn seq_of_origin(&self, origin: u64) -> Option<u64> {
        self.entries
            .iter()
            .filter(|x| x.origin == origin)
            .map(|x| x.seq)
            .max()
    }

    /// True iff every entry of `other` is covered by this list.
    pub fn contains(&self, other: &GtidList) -> bool {
        other
            .entries
            .iter()
            .all(|x| self.seq_of(x.domain, x.origin) >= x.seq)
    }

    /// `(ahead, behind)`: entries where this list is ahead of `other`
    /// and entries where `other` is ahead of this list.
    pub fn diff(&self, other: &GtidList) -> (GtidList, GtidList) {
        let ahead = self
            .entries
            .iter()
            .filter(|x| x.seq > other.seq_of(x.domain, x.origin))
            .copied();
        let behind = other
            .entries
            .iter()
            .filter(|x| x.seq > self.seq_of(x.domain, x.origin))
            .copied();
        (Self::from_entries(ahead), Self::from_entries(behind))
    }

    /// Entries of this list not covered by `other`.
    pub fn subtract(&self, other: &GtidList) -> GtidList {
        self.diff(other).0
    }

    pub fn merge_max(&self, other: &GtidList) -> GtidList {
        Self::from_entries(self.entries.iter().chain(other.entries.iter()).copied())
    }

    /// Partial order by containment. `None` when each side has something the other lacks.
    pub fn compare(&self, other: &GtidList) -> Option<Ordering> {
        match (self.contains(other), other.contains(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }

    /// Sum of sequences, used to order lists that are not comparable.
    pub fn seq_sum(&self) -> u128 {
        self.entries.iter().map(|x| x.seq as u128).sum()
    }
}

impl std::fmt::Display for GtidList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

impl std::str::FromStr for GtidList {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for GtidList {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<GtidList> for String {
    fn from(x: GtidList) -> Self {
        x.render()
    }
}

fn parse_mariadb(tok: &str) -> Result<Gtid> {
    let mut it = tok.splitn(3, '-');
    let (Some(d), Some(o), Some(s)) = (it.next(), it.next(), it.next()) else {
        bail!("bad gtid `{tok}`");
    };
    Ok(Gtid {
        domain: d.parse().with_context(|| format!("bad domain in `{tok}`"))?,
        origin: o.parse().with_context(|| format!("bad origin in `{tok}`"))?,
        seq: s.parse().with_context(|| format!("bad sequence in `{tok}`"))?,
    })
}

fn parse_mysql(tok: &str) -> Result<Gtid> {
    let mut parts = tok.split(':');
    let uuid = parts.next().unwrap_or_default();
    ensure!(uuid.len() == 36, "bad source uuid in `{tok}`");

    let mut high = None;
    for range in parts {
        // Tagged GTIDs carry a non-numeric tag before the intervals.
        if !range.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let hi = match range.split_once('-') {
            Some((lo, hi)) => {
                let lo: u64 = lo.parse().with_context(|| format!("bad range in `{tok}`"))?;
                let hi: u64 = hi.parse().with_context(|| format!("bad range in `{tok}`"))?;
                ensure!(lo <= hi, "inverted range in `{tok}`");
                hi
            }
            None => range
                .parse()
                .with_context(|| format!("bad sequence in `{tok}`"))?,
        };
        high = Some(u64::max(high.unwrap_or(0), hi));
    }
    let seq = high.with_context(|| format!("no interval in `{tok}`"))?;

    Ok(Gtid {
        domain: 0,
        origin: origin_of_uuid(uuid),
        seq,
    })
}
