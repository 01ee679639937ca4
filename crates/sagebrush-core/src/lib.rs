//! Core domain model for Sagebrush crew enrichment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "sagebrush-core";

/// A movie to enrich: local primary key plus the TMDB id used remotely and in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetEntity {
    pub local_id: i64,
    pub remote_id: i64,
}

impl TargetEntity {
    pub fn new(local_id: i64, remote_id: i64) -> Self {
        Self {
            local_id,
            remote_id,
        }
    }
}

/// Full credits payload as returned by the remote service, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawMetadata(pub JsonValue);

impl RawMetadata {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    /// `(job, name)` pairs of the `crew` array, in payload order. Entries missing
    /// either string field are yielded with `None` in that slot.
    pub fn crew_entries(&self) -> impl Iterator<Item = (Option<&str>, Option<&str>)> {
        self.0
            .get("crew")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .map(|entry| {
                (
                    entry.get("job").and_then(JsonValue::as_str),
                    entry.get("name").and_then(JsonValue::as_str),
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub role: String,
    pub name: String,
}

/// Contributors selected from raw metadata; this is what lands in `movies.crew`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DerivedFields(pub Vec<Contributor>);

impl DerivedFields {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contributors(&self) -> &[Contributor] {
        &self.0
    }
}

/// Maps a TMDB crew `job` onto the role name persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRule {
    pub job: String,
    pub role: String,
}

/// Selects qualifying contributors from a credits payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePredicate {
    rules: Vec<RoleRule>,
}

impl Default for RolePredicate {
    fn default() -> Self {
        Self {
            rules: vec![RoleRule {
                job: "Director".to_string(),
                role: "director".to_string(),
            }],
        }
    }
}

impl RolePredicate {
    pub fn new(rules: Vec<RoleRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[RoleRule] {
        &self.rules
    }

    /// Role for a crew job, if any rule matches. Job names compare exactly.
    pub fn role_for(&self, job: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.job == job)
            .map(|rule| rule.role.as_str())
    }

    /// Deterministic: payload order is preserved and empty names are dropped. Names are
    /// stored exactly as the service returned them.
    pub fn derive(&self, raw: &RawMetadata) -> DerivedFields {
        let contributors = raw
            .crew_entries()
            .filter_map(|(job, name)| {
                let role = self.role_for(job?)?;
                let name = name.filter(|name| !name.is_empty())?;
                Some(Contributor {
                    role: role.to_string(),
                    name: name.to_string(),
                })
            })
            .collect();
        DerivedFields(contributors)
    }
}

/// One line of the credits cache. The aliases read caches written before the
/// field names were made source-neutral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(alias = "tmdb_id")]
    pub remote_id: i64,
    #[serde(alias = "directors", default)]
    pub derived_fields: DerivedFields,
    #[serde(alias = "raw")]
    pub raw_payload: RawMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl CacheRecord {
    pub fn new(
        remote_id: i64,
        raw_payload: RawMetadata,
        derived_fields: DerivedFields,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            remote_id,
            derived_fields,
            raw_payload,
            fetched_at: Some(fetched_at),
        }
    }
}

/// An update waiting for the next batch commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedUpdate {
    pub local_id: i64,
    pub remote_id: i64,
    pub fields: DerivedFields,
}
