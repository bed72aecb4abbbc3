//! Line-level records stored inside a file chunk.
//!
//! Every record is persisted as a positional JSON array with trailing
//! optional fields omitted, which is why the serde impls go through
//! `Vec<Value>` instead of deriving field names.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::coverage::{CoverageValue, PartialRange};
use crate::error::CovstoreError;

/// Identifier of a branch arm. Instrumenters emit either indexes or names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BranchRef {
    Index(i64),
    Name(String),
}

/// Cyclomatic complexity: either a plain total or a `(covered, total)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Complexity {
    Total(i64),
    Pair(i64, i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineType {
    #[serde(rename = "b")]
    Branch,
    #[serde(rename = "m")]
    Method,
}

/// Walks a positional array, treating absent and `null` slots alike.
struct Slots(std::vec::IntoIter<Value>);

impl Slots {
    fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CovstoreError> {
        match self.0.next() {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
        }
    }

    fn coverage(&mut self) -> Result<CoverageValue, CovstoreError> {
        Ok(self.next()?.unwrap_or_default())
    }
}

fn trim_trailing_nulls(mut items: Vec<Value>, keep: usize) -> Vec<Value> {
    while items.len() > keep && items.last().is_some_and(Value::is_null) {
        items.pop();
    }
    items
}

/// One session's contribution to one line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct LineSession {
    pub id: u32,
    pub coverage: CoverageValue,
    pub branches: Option<Vec<BranchRef>>,
    pub partials: Option<Vec<PartialRange>>,
    pub complexity: Option<Complexity>,
}

impl LineSession {
    pub fn new(id: u32, coverage: CoverageValue) -> Self {
        Self {
            id,
            coverage,
            branches: None,
            partials: None,
            complexity: None,
        }
    }

    #[must_use]
    pub fn with_branches(mut self, missing: Vec<BranchRef>) -> Self {
        self.branches = Some(missing);
        self
    }

    #[must_use]
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = Some(complexity);
        self
    }
}

impl TryFrom<Vec<Value>> for LineSession {
    type Error = CovstoreError;

    fn try_from(items: Vec<Value>) -> Result<Self, Self::Error> {
        if items.len() < 2 {
            return Err(CovstoreError::Parse(format!(
                "line session needs at least 2 elements, got {}",
                items.len()
            )));
        }
        let mut slots = Slots(items.into_iter());
        let id = slots
            .next::<u32>()?
            .ok_or_else(|| CovstoreError::Parse("line session without id".to_string()))?;
        Ok(Self {
            id,
            coverage: slots.coverage()?,
            branches: slots.next()?,
            partials: slots.next()?,
            complexity: slots.next()?,
        })
    }
}

impl From<LineSession> for Vec<Value> {
    fn from(s: LineSession) -> Self {
        trim_trailing_nulls(
            vec![
                json!(s.id),
                Value::from(s.coverage),
                json!(s.branches),
                json!(s.partials),
                json!(s.complexity),
            ],
            2,
        )
    }
}

/// Label-attributed coverage for one session on one line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct CoverageDatapoint {
    pub sessionid: u32,
    pub coverage: CoverageValue,
    pub coverage_type: Option<String>,
    pub label_ids: Vec<u32>,
}

impl CoverageDatapoint {
    pub fn new(sessionid: u32, coverage: CoverageValue, label_ids: Vec<u32>) -> Self {
        Self {
            sessionid,
            coverage,
            coverage_type: None,
            label_ids,
        }
    }

    /// Ordering used when datapoints are merged.
    pub fn sort_key(&self) -> (u32, String, String, Vec<u32>) {
        (
            self.sessionid,
            self.coverage.to_string(),
            self.coverage_type.clone().unwrap_or_default(),
            self.label_ids.clone(),
        )
    }
}

impl TryFrom<Vec<Value>> for CoverageDatapoint {
    type Error = CovstoreError;

    fn try_from(items: Vec<Value>) -> Result<Self, Self::Error> {
        let mut slots = Slots(items.into_iter());
        let sessionid = slots
            .next::<u32>()?
            .ok_or_else(|| CovstoreError::Parse("datapoint without session id".to_string()))?;
        Ok(Self {
            sessionid,
            coverage: slots.coverage()?,
            coverage_type: slots.next()?,
            label_ids: slots.next()?.unwrap_or_default(),
        })
    }
}

impl From<CoverageDatapoint> for Vec<Value> {
    fn from(dp: CoverageDatapoint) -> Self {
        vec![
            json!(dp.sessionid),
            Value::from(dp.coverage),
            json!(dp.coverage_type),
            json!(dp.label_ids),
        ]
    }
}

/// Merged state of one source line.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct ReportLine {
    pub coverage: CoverageValue,
    pub line_type: Option<LineType>,
    pub sessions: Vec<LineSession>,
    pub messages: Option<Value>,
    pub complexity: Option<Complexity>,
    pub datapoints: Option<Vec<CoverageDatapoint>>,
}

impl ReportLine {
    pub fn new(coverage: CoverageValue) -> Self {
        Self {
            coverage,
            ..Default::default()
        }
    }

    /// A line carrying a single session's reading.
    pub fn from_session(session: LineSession) -> Self {
        Self {
            coverage: session.coverage.clone(),
            complexity: session.complexity,
            sessions: vec![session],
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_type(mut self, line_type: LineType) -> Self {
        self.line_type = Some(line_type);
        self
    }

    #[must_use]
    pub fn with_datapoints(mut self, datapoints: Vec<CoverageDatapoint>) -> Self {
        self.datapoints = Some(datapoints);
        self
    }

    pub fn message_count(&self) -> u32 {
        match &self.messages {
            Some(Value::Array(items)) => items.len() as u32,
            Some(Value::Object(items)) => items.len() as u32,
            _ => 0,
        }
    }
}

impl TryFrom<Vec<Value>> for ReportLine {
    type Error = CovstoreError;

    fn try_from(items: Vec<Value>) -> Result<Self, Self::Error> {
        if items.is_empty() {
            return Err(CovstoreError::Parse("empty line record".to_string()));
        }
        let mut slots = Slots(items.into_iter());
        Ok(Self {
            coverage: slots.coverage()?,
            line_type: slots.next()?,
            sessions: slots.next()?.unwrap_or_default(),
            messages: slots.next()?,
            complexity: slots.next()?,
            datapoints: slots.next()?,
        })
    }
}

impl From<ReportLine> for Vec<Value> {
    fn from(line: ReportLine) -> Self {
        vec![
            Value::from(line.coverage),
            json!(line.line_type),
            json!(line.sessions),
            line.messages.unwrap_or(Value::Null),
            json!(line.complexity),
            json!(line.datapoints),
        ]
    }
}
