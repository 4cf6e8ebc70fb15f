//! Resource locators: structured pointers to stage payloads.
//!
//! A locator has one of two textual forms:
//!
//! - `scheme://host/segment/segment` — an object in the blob store. Blob
//!   locators carry exactly two segments, the bucket and the object key.
//! - `scheme://host?key=value&key=value` — a query against an external
//!   service (e.g. `web://arxiv?query=graphs&limit=5`).
//!
//! Parsing and [`Display`](std::fmt::Display) are inverse operations for every
//! value that can be constructed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::LocatorError;

/// The addressed part of a locator: a path inside the host, or query pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocatorTarget {
    /// Ordered, non-empty path segments.
    Path(Vec<String>),
    /// Ordered `key=value` pairs.
    Query(Vec<(String, String)>),
}

/// Immutable pointer to a payload in the blob store or an external service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceLocator {
    scheme: String,
    host: String,
    target: LocatorTarget,
}

impl ResourceLocator {
    /// Creates a path-form locator.
    pub fn with_path<I, S>(
        scheme: impl Into<String>,
        host: impl Into<String>,
        segments: I,
    ) -> Result<Self, LocatorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            check_segment(segment)?;
        }
        Self::build(scheme.into(), host.into(), LocatorTarget::Path(segments))
    }

    /// Creates a blob-store locator addressing `bucket/object`.
    pub fn blob(
        scheme: impl Into<String>,
        host: impl Into<String>,
        bucket: impl Into<String>,
        object: impl Into<String>,
    ) -> Result<Self, LocatorError> {
        Self::with_path(scheme, host, [bucket.into(), object.into()])
    }

    /// Creates a query-form locator.
    pub fn with_query<I, K, V>(
        scheme: impl Into<String>,
        host: impl Into<String>,
        pairs: I,
    ) -> Result<Self, LocatorError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if pairs.is_empty() {
            return Err(LocatorError::EmptyQuery);
        }
        for (key, value) in &pairs {
            check_query_pair(key, value)?;
        }
        Self::build(scheme.into(), host.into(), LocatorTarget::Query(pairs))
    }

    fn build(scheme: String, host: String, target: LocatorTarget) -> Result<Self, LocatorError> {
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(LocatorError::InvalidScheme(scheme));
        }
        if host.is_empty() || host.contains(['/', '?', '&', '=']) {
            return Err(LocatorError::InvalidHost(host));
        }
        Ok(Self {
            scheme,
            host,
            target,
        })
    }

    /// Returns the scheme (e.g. `"minio"`).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the host (e.g. `"arxiv"`).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the addressed target.
    pub fn target(&self) -> &LocatorTarget {
        &self.target
    }

    /// Returns the path segments, or an empty slice for query-form locators.
    pub fn segments(&self) -> &[String] {
        match &self.target {
            LocatorTarget::Path(segments) => segments,
            LocatorTarget::Query(_) => &[],
        }
    }

    /// Returns the first value recorded for `key`, if this is a query locator.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        match &self.target {
            LocatorTarget::Query(pairs) => pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            LocatorTarget::Path(_) => None,
        }
    }

    /// Splits a blob locator into `(bucket, object)`.
    ///
    /// Fails unless the locator is path-form with exactly two segments.
    pub fn bucket_object(&self) -> Result<(&str, &str), LocatorError> {
        match &self.target {
            LocatorTarget::Path(segments) if segments.len() == 2 => {
                Ok((segments[0].as_str(), segments[1].as_str()))
            }
            LocatorTarget::Path(segments) => Err(LocatorError::NotBlobAddress {
                segments: segments.len(),
            }),
            LocatorTarget::Query(_) => Err(LocatorError::NotBlobAddress { segments: 0 }),
        }
    }

    /// Returns `true` if scheme and host both match.
    pub fn is_from(&self, scheme: &str, host: &str) -> bool {
        self.scheme == scheme && self.host == host
    }
}

fn check_segment(segment: &str) -> Result<(), LocatorError> {
    if segment.is_empty() || segment.contains(['/', '?']) {
        return Err(LocatorError::InvalidSegment(segment.to_owned()));
    }
    Ok(())
}

fn check_query_pair(key: &str, value: &str) -> Result<(), LocatorError> {
    if key.is_empty() || key.contains(['=', '&', '/']) || value.contains('&') {
        return Err(LocatorError::InvalidQueryPair(format!("{key}={value}")));
    }
    Ok(())
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        match &self.target {
            LocatorTarget::Path(segments) => {
                for segment in segments {
                    write!(f, "/{segment}")?;
                }
            }
            LocatorTarget::Query(pairs) => {
                for (i, (key, value)) in pairs.iter().enumerate() {
                    let sep = if i == 0 { '?' } else { '&' };
                    write!(f, "{sep}{key}={value}")?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for ResourceLocator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| LocatorError::MissingScheme(s.to_owned()))?;

        let query_at = rest.find('?');
        let path_at = rest.find('/');
        match (query_at, path_at) {
            (Some(q), p) if p.map_or(true, |p| q < p) => {
                let (host, query) = (&rest[..q], &rest[q + 1..]);
                let pairs = query
                    .split('&')
                    .map(|pair| {
                        pair.split_once('=')
                            .ok_or_else(|| LocatorError::InvalidQueryPair(pair.to_owned()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::with_query(scheme, host, pairs)
            }
            (_, Some(p)) => {
                let (host, path) = (&rest[..p], &rest[p + 1..]);
                Self::with_path(scheme, host, path.split('/'))
            }
            (_, None) => Self::with_path(scheme, rest, Vec::<String>::new()),
        }
    }
}

impl Serialize for ResourceLocator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceLocator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
