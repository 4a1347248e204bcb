//! Object storage options and the index schema timeline.

use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use lokistack_core::stack::{LokiStackStorageStatus, ObjectStorageSchema, ObjectStorageSpec};
use serde::{Deserialize, Serialize};

/// Hours ahead of now within which a schema counts as already in effect.
pub const SCHEMA_UPDATE_BUFFER_HOURS: i64 = 2;

/// Non-secret connection settings per backend; credentials stay in the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    S3 { endpoint: String, buckets: String, region: Option<String> },
    Azure { environment: String, container: String, account_name: String },
    Gcs { bucket: String },
    Swift { auth_url: String, container: String, region: Option<String> },
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::S3 { endpoint: String::new(), buckets: String::new(), region: None }
    }
}

impl StorageBackend {
    pub fn object_store(&self) -> &'static str {
        match self {
            Self::S3 { .. } => "s3",
            Self::Azure { .. } => "azure",
            Self::Gcs { .. } => "gcs",
            Self::Swift { .. } => "swift",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Config map holding `service-ca.crt`.
    pub ca: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectStorage {
    pub secret_name: String,
    pub backend: StorageBackend,
    pub schemas: Vec<ObjectStorageSchema>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("storage does not declare any schemas")]
    Empty,
    #[error("failed to parse effective date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("effective dates are not unique: {0}")]
    DuplicateDate(String),
    #[error("schema does not contain a valid starting effective date")]
    NoValidStartDate,
    #[error("cannot retroactively remove or change schema effective {0}")]
    RetroactiveChange(String),
    #[error("cannot retroactively add schema effective {0}")]
    RetroactiveAddition(String),
}

fn start_of(date: &str) -> Result<DateTime<Utc>, SchemaError> {
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| SchemaError::InvalidDate(date.to_string()))?;
    let midnight = day.and_hms_opt(0, 0, 0).ok_or_else(|| SchemaError::InvalidDate(date.to_string()))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

/// Validate the declared schemas against the ones already applied and return
/// them ordered by effective date.
///
/// A schema whose start lies before `now` plus the update buffer is in effect:
/// once recorded in `status` it can no longer be removed or changed, and a new
/// one cannot be added in that window.
pub fn build_schema_config(
    now: DateTime<Utc>,
    spec: &ObjectStorageSpec,
    status: &LokiStackStorageStatus,
) -> Result<Vec<ObjectStorageSchema>, SchemaError> {
    if spec.schemas.is_empty() {
        return Err(SchemaError::Empty);
    }
    let cutoff = now + Duration::hours(SCHEMA_UPDATE_BUFFER_HOURS);

    let mut seen = HashSet::new();
    let mut dated = Vec::with_capacity(spec.schemas.len());
    for sc in &spec.schemas {
        let start = start_of(&sc.effective_date)?;
        if !seen.insert(sc.effective_date.as_str()) {
            return Err(SchemaError::DuplicateDate(sc.effective_date.clone()));
        }
        dated.push((start, sc));
    }
    if !dated.iter().any(|(start, _)| *start < cutoff) {
        return Err(SchemaError::NoValidStartDate);
    }

    if !status.schemas.is_empty() {
        for applied in &status.schemas {
            if start_of(&applied.effective_date)? < cutoff && !spec.schemas.contains(applied) {
                return Err(SchemaError::RetroactiveChange(applied.effective_date.clone()));
            }
        }
        for (start, sc) in &dated {
            if *start < cutoff && !status.schemas.contains(sc) {
                return Err(SchemaError::RetroactiveAddition(sc.effective_date.clone()));
            }
        }
    }

    dated.sort_by_key(|(start, _)| *start);
    Ok(dated.into_iter().map(|(_, sc)| sc.clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lokistack_core::stack::ObjectStorageSchemaVersion::{V11, V12};

    fn schema(v: lokistack_core::stack::ObjectStorageSchemaVersion, date: &str) -> ObjectStorageSchema {
        ObjectStorageSchema { version: v, effective_date: date.into() }
    }

    fn spec(schemas: Vec<ObjectStorageSchema>) -> ObjectStorageSpec {
        ObjectStorageSpec { schemas, ..Default::default() }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 6, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn schemas_are_sorted_by_date() {
        let s = spec(vec![schema(V12, "2022-07-01"), schema(V11, "2020-10-11")]);
        let out = build_schema_config(now(), &s, &LokiStackStorageStatus::default()).unwrap();
        assert_eq!(out[0].effective_date, "2020-10-11");
        assert_eq!(out[1].effective_date, "2022-07-01");
    }

    #[test]
    fn rejects_empty_bad_dates_and_duplicates() {
        let st = LokiStackStorageStatus::default();
        assert_eq!(build_schema_config(now(), &spec(vec![]), &st), Err(SchemaError::Empty));
        assert!(matches!(
            build_schema_config(now(), &spec(vec![schema(V11, "2020/10/11")]), &st),
            Err(SchemaError::InvalidDate(_))
        ));
        assert!(matches!(
            build_schema_config(now(), &spec(vec![schema(V11, "2020-10-11"), schema(V12, "2020-10-11")]), &st),
            Err(SchemaError::DuplicateDate(_))
        ));
    }

    #[test]
    fn requires_a_schema_already_in_effect() {
        let s = spec(vec![schema(V12, "2023-01-01")]);
        assert_eq!(
            build_schema_config(now(), &s, &LokiStackStorageStatus::default()),
            Err(SchemaError::NoValidStartDate)
        );
    }

    #[test]
    fn applied_schemas_are_immutable() {
        let status = LokiStackStorageStatus { schemas: vec![schema(V11, "2020-10-11")] };

        let changed = spec(vec![schema(V12, "2020-10-11")]);
        assert!(matches!(build_schema_config(now(), &changed, &status), Err(SchemaError::RetroactiveChange(_))));

        let backfilled = spec(vec![schema(V11, "2020-10-11"), schema(V12, "2022-06-01")]);
        assert!(matches!(build_schema_config(now(), &backfilled, &status), Err(SchemaError::RetroactiveAddition(_))));

        let upgraded = spec(vec![schema(V11, "2020-10-11"), schema(V12, "2022-06-12")]);
        assert_eq!(build_schema_config(now(), &upgraded, &status).unwrap().len(), 2);
    }

    #[test]
    fn pending_schemas_may_be_withdrawn() {
        let status = LokiStackStorageStatus { schemas: vec![schema(V11, "2020-10-11"), schema(V12, "2022-07-01")] };
        let s = spec(vec![schema(V11, "2020-10-11")]);
        assert!(build_schema_config(now(), &s, &status).is_ok());
    }
}
