use std::collections::{btree_map, BTreeMap};

use serde::{Deserialize, Serialize};

use crate::{
    measure::{Measure, ResultType},
    provider::ProviderError,
};

/// A raw value handed over by a provider, before it is encoded into a [`ResultEntry`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
}

impl Value {
    /// Encodes the value as text of the given type, or `None` if it cannot be
    /// represented losslessly.
    fn encode(self, ty: ResultType) -> Option<String> {
        let text = match (self, ty) {
            (Value::Str(s), ResultType::String) => s,
            (Value::Int(i), ResultType::String | ResultType::Integer) => i.to_string(),
            (Value::Int(i), ResultType::Floating) => format_float(i as f64),
            (Value::Float(f), ResultType::String | ResultType::Floating) if f.is_finite() => {
                format_float(f)
            }
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }
}

/// Decimal places kept when rendering floating values.
const FLOAT_DECIMALS: i32 = 3;

/// Renders `f` rounded to [`FLOAT_DECIMALS`], without trailing zeros.
fn format_float(f: f64) -> String {
    let scale = 10_f64.powi(FLOAT_DECIMALS);
    // adding zero turns a rounded -0 into 0
    let rounded = (f * scale).round() / scale + 0.0;
    if rounded.is_finite() {
        rounded.to_string()
    } else {
        f.to_string()
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::Int(i64::try_from(u).unwrap_or(i64::MAX))
    }
}

impl From<usize> for Value {
    fn from(u: usize) -> Self {
        Value::from(u as u64)
    }
}

impl From<u32> for Value {
    fn from(u: u32) -> Self {
        Value::Int(i64::from(u))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Int(i64::from(b))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f64::from(f))
    }
}

/// The value produced for one measure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub source: Measure,
    #[serde(rename = "type")]
    pub result_type: ResultType,
    pub value: String,
}

impl ResultEntry {
    /// Builds the entry for `source`, typed as its catalog declares.
    pub fn new(source: Measure, value: impl Into<Value>) -> Option<Self> {
        let result_type = source.info().result_type;
        let value = value.into().encode(result_type)?;
        Some(Self {
            source,
            result_type,
            value,
        })
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value.parse().ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.parse().ok()
    }
}

/// Mapping from measure to its result; the output of every measurement operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Results {
    entries: BTreeMap<Measure, ResultEntry>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value for `measure`. Values that do not fit the declared type are dropped.
    pub fn insert(&mut self, measure: Measure, value: impl Into<Value>) {
        let value = value.into();
        match ResultEntry::new(measure, value.clone()) {
            Some(entry) => {
                self.entries.insert(measure, entry);
            }
            None => log::error!(
                "dropping value {value:?} for {measure}: not representable as {}",
                measure.info().result_type
            ),
        }
    }

    /// Adds the outcome of reading one measure; failures are logged and left out.
    pub fn record<V: Into<Value>>(&mut self, measure: Measure, value: Result<V, ProviderError>) {
        match value {
            Ok(v) => self.insert(measure, v),
            Err(e) => log::warn!("could not read {measure}: {e}"),
        }
    }

    pub fn get(&self, measure: Measure) -> Option<&ResultEntry> {
        self.entries.get(&measure)
    }

    pub fn contains(&self, measure: Measure) -> bool {
        self.entries.contains_key(&measure)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn measures(&self) -> impl Iterator<Item = Measure> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Measure, ResultEntry> {
        self.entries.iter()
    }

    pub fn merge(&mut self, other: Results) {
        self.entries.extend(other.entries);
    }

    /// Keeps only the entries for the given measures.
    pub(crate) fn restrict_to(&mut self, measures: &[Measure]) {
        self.entries.retain(|m, _| measures.contains(m));
    }

    pub fn to_json(&self) -> String {
        crate::format::json(self)
    }
}

impl IntoIterator for Results {
    type Item = (Measure, ResultEntry);
    type IntoIter = btree_map::IntoIter<Measure, ResultEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Results {
    type Item = (&'a Measure, &'a ResultEntry);
    type IntoIter = btree_map::Iter<'a, Measure, ResultEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
