//! Upload sessions and the per-file session totals table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::CovstoreError;
use crate::totals::ReportTotals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    #[default]
    Uploaded,
    Carriedforward,
}

/// One upload's contribution to a report.
///
/// Persisted in the manifest under single-letter keys. The id is the map
/// key in the manifest, not part of the encoded body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Session {
    #[serde(skip)]
    pub id: u32,
    #[serde(rename = "t", default)]
    pub totals: Option<ReportTotals>,
    /// Upload time as a unix timestamp.
    #[serde(rename = "d", default, deserialize_with = "lenient_timestamp")]
    pub time: Option<i64>,
    #[serde(rename = "a", default)]
    pub archive: Option<String>,
    #[serde(rename = "f", default, deserialize_with = "null_as_default")]
    pub flags: Vec<String>,
    #[serde(rename = "c", default)]
    pub provider: Option<String>,
    #[serde(rename = "n", default, deserialize_with = "lenient_string")]
    pub build: Option<String>,
    #[serde(rename = "N", default)]
    pub name: Option<String>,
    #[serde(rename = "j", default, deserialize_with = "lenient_string")]
    pub job: Option<String>,
    #[serde(rename = "u", default)]
    pub url: Option<String>,
    #[serde(rename = "p", default)]
    pub state: Option<String>,
    #[serde(rename = "e", default)]
    pub env: Option<Value>,
    #[serde(rename = "st", default, deserialize_with = "null_as_default")]
    pub session_type: SessionType,
    #[serde(rename = "se", default, deserialize_with = "null_as_default")]
    pub session_extras: BTreeMap<String, Value>,
}

impl Session {
    pub fn new<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            flags: flags.into_iter().map(Into::into).collect(),
            time: Some(Utc::now().timestamp()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time.timestamp());
        self
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.time.and_then(|t| DateTime::from_timestamp(t, 0))
    }

    /// True if this session carries any of `flags`.
    pub fn has_any_flag<S: AsRef<str>>(&self, flags: &[S]) -> bool {
        flags
            .iter()
            .any(|f| self.flags.iter().any(|own| own == f.as_ref()))
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + DeserializeOwned,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|t| t.timestamp())
        }),
        _ => None,
    })
}

/// Per-session totals for one file.
///
/// Older manifests store a positional list indexed by session id; newer
/// ones a sparse object `{"meta": {"real_length": N}, "<id>": totals}`.
/// Both are read, only the sparse form is written.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionTotalsArray {
    real_length: u32,
    totals: BTreeMap<u32, ReportTotals>,
}

impl SessionTotalsArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<&ReportTotals> {
        self.totals.get(&id)
    }

    pub fn insert(&mut self, id: u32, totals: ReportTotals) {
        self.real_length = self.real_length.max(id.saturating_add(1));
        self.totals.insert(id, totals);
    }

    pub fn remove(&mut self, id: u32) -> Option<ReportTotals> {
        self.totals.remove(&id)
    }

    /// Move an entry to a new id, overwriting whatever was there.
    pub fn change_id(&mut self, old: u32, new: u32) {
        if let Some(totals) = self.totals.remove(&old) {
            self.insert(new, totals);
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.totals.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &ReportTotals)> {
        self.totals.iter().map(|(id, t)| (*id, t))
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    pub fn real_length(&self) -> u32 {
        self.real_length
    }
}

impl TryFrom<Value> for SessionTotalsArray {
    type Error = CovstoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let mut array = SessionTotalsArray::new();
        match value {
            Value::Null => {}
            Value::Array(items) => {
                array.real_length = items.len() as u32;
                for (id, item) in items.into_iter().enumerate() {
                    if !item.is_null() {
                        array.totals.insert(id as u32, ReportTotals::try_from(item)?);
                    }
                }
            }
            Value::Object(mut map) => {
                let meta = map.remove("meta");
                for (key, item) in map {
                    if item.is_null() {
                        continue;
                    }
                    let id = key.parse::<u32>().map_err(|_| {
                        CovstoreError::Parse(format!("bad session id '{key}' in session totals"))
                    })?;
                    array.insert(id, ReportTotals::try_from(item)?);
                }
                let declared = meta.as_ref().and_then(|m| {
                    m.get("real_length")
                        .or_else(|| m.get("session_count"))
                        .and_then(Value::as_u64)
                });
                if let Some(declared) = declared {
                    array.real_length = array.real_length.max(declared as u32);
                }
            }
            other => {
                return Err(CovstoreError::Parse(format!(
                    "session totals must be a list or object, got {other}"
                )))
            }
        }
        Ok(array)
    }
}

impl From<SessionTotalsArray> for Value {
    fn from(array: SessionTotalsArray) -> Self {
        let mut map = Map::new();
        map.insert("meta".to_string(), json!({ "real_length": array.real_length }));
        for (id, totals) in array.totals {
            map.insert(id.to_string(), Value::from(totals));
        }
        Value::Object(map)
    }
}

impl Serialize for SessionTotalsArray {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Value::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SessionTotalsArray {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        SessionTotalsArray::try_from(value).map_err(serde::de::Error::custom)
    }
}
