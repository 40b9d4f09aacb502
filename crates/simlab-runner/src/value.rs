//! Values produced by the analyse stage and their accumulation per condition.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key used when a scalar result is flattened into a row.
pub const SCALAR_KEY: &str = "value";

/// Output of one successful analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AnalysisValue {
    Scalar(f64),
    /// Named numeric vector; order is preserved into the result rows.
    Vector(IndexMap<String, f64>),
    /// Lists and nested records. Must be a JSON object or array.
    Structured(Value),
}

impl AnalysisValue {
    pub fn vector<K: Into<String>>(entries: impl IntoIterator<Item = (K, f64)>) -> Self {
        AnalysisValue::Vector(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Names of entries that are missing or not finite. Empty when valid.
    ///
    /// Only the top level of a structured value is inspected: a `null`
    /// member counts as missing, nested records are left to the summarise stage.
    pub fn invalid_entries(&self) -> Vec<String> {
        match self {
            AnalysisValue::Scalar(v) => {
                if v.is_finite() {
                    Vec::new()
                } else {
                    vec![SCALAR_KEY.to_string()]
                }
            }
            AnalysisValue::Vector(entries) => entries
                .iter()
                .filter(|(_, v)| !v.is_finite())
                .map(|(k, _)| k.clone())
                .collect(),
            AnalysisValue::Structured(Value::Object(map)) => map
                .iter()
                .filter(|(_, v)| v.is_null())
                .map(|(k, _)| k.clone())
                .collect(),
            AnalysisValue::Structured(Value::Array(items)) => items
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_null())
                .map(|(i, _)| format!("[{}]", i + 1))
                .collect(),
            AnalysisValue::Structured(Value::Null) => vec![SCALAR_KEY.to_string()],
            AnalysisValue::Structured(_) => Vec::new(),
        }
    }

    /// Error when the value is neither numeric nor an aggregate.
    pub fn check_type(&self) -> Result<(), String> {
        match self {
            AnalysisValue::Scalar(_) | AnalysisValue::Vector(_) => Ok(()),
            AnalysisValue::Structured(Value::Number(_)) => Ok(()),
            AnalysisValue::Structured(Value::Object(_)) | AnalysisValue::Structured(Value::Array(_)) => {
                Ok(())
            }
            AnalysisValue::Structured(other) => Err(format!(
                "analyse must return a number, a named numeric vector or a list; got {}",
                json_type_name(other)
            )),
        }
    }

    /// Flatten into one row of the condition result set.
    ///
    /// Scalars become `{"value": x}`, vectors keep their names, objects keep
    /// their top-level members and arrays are keyed `V1, V2, ...`.
    pub fn to_row(&self) -> IndexMap<String, Value> {
        let mut row = IndexMap::new();
        match self {
            AnalysisValue::Scalar(v) => {
                row.insert(SCALAR_KEY.to_string(), number(*v));
            }
            AnalysisValue::Vector(entries) => {
                for (k, v) in entries {
                    row.insert(k.clone(), number(*v));
                }
            }
            AnalysisValue::Structured(Value::Object(map)) => {
                for (k, v) in map {
                    row.insert(k.clone(), v.clone());
                }
            }
            AnalysisValue::Structured(Value::Array(items)) => {
                for (i, v) in items.iter().enumerate() {
                    row.insert(format!("V{}", i + 1), v.clone());
                }
            }
            AnalysisValue::Structured(other) => {
                row.insert(SCALAR_KEY.to_string(), other.clone());
            }
        }
        row
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        match self {
            AnalysisValue::Scalar(v) if name == SCALAR_KEY => Some(*v),
            AnalysisValue::Scalar(_) => None,
            AnalysisValue::Vector(entries) => entries.get(name).copied(),
            AnalysisValue::Structured(Value::Object(map)) => map.get(name).and_then(|v| v.as_f64()),
            AnalysisValue::Structured(Value::Number(n)) if name == SCALAR_KEY => n.as_f64(),
            AnalysisValue::Structured(_) => None,
        }
    }
}

impl From<f64> for AnalysisValue {
    fn from(v: f64) -> Self {
        AnalysisValue::Scalar(v)
    }
}

impl From<IndexMap<String, f64>> for AnalysisValue {
    fn from(v: IndexMap<String, f64>) -> Self {
        AnalysisValue::Vector(v)
    }
}

fn number(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One valid replication plus the diagnostics gathered on the way to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// 1-based replication index.
    pub replication: usize,
    pub value: AnalysisValue,
    /// Cleaned messages of the failed attempts that preceded this draw.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Warnings captured during the successful analysis.
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Analysis results of a condition in replication order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    results: Vec<AnalysisResult>,
}

impl ResultSet {
    pub fn new(results: Vec<AnalysisResult>) -> Self {
        Self { results }
    }

    pub fn push(&mut self, result: AnalysisResult) {
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnalysisResult> {
        self.results.iter()
    }

    pub fn as_slice(&self) -> &[AnalysisResult] {
        &self.results
    }

    pub fn values(&self) -> impl Iterator<Item = &AnalysisValue> {
        self.results.iter().map(|r| &r.value)
    }

    /// Numeric column `name` across replications; rows lacking it are skipped.
    pub fn column(&self, name: &str) -> Vec<f64> {
        self.values().filter_map(|v| v.get(name)).collect()
    }

    pub fn rows(&self) -> Vec<IndexMap<String, Value>> {
        self.values().map(|v| v.to_row()).collect()
    }

    pub fn into_inner(self) -> Vec<AnalysisResult> {
        self.results
    }
}

/// Output of the summarise stage for one condition.
pub type SummaryRow = IndexMap<String, f64>;

/// Serde adapter for a stored summary row. JSON has no NaN or infinity, so
/// those cells are written as the strings `"NaN"`, `"Infinity"` and
/// `"-Infinity"`; a `null` cell reads back as NaN.
pub(crate) mod summary_cells {
    use super::SummaryRow;
    use indexmap::IndexMap;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(row: &Option<SummaryRow>, s: S) -> Result<S::Ok, S::Error> {
        row.as_ref()
            .map(|r| {
                r.iter()
                    .map(|(k, v)| (k.as_str(), encode(*v)))
                    .collect::<IndexMap<&str, Value>>()
            })
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SummaryRow>, D::Error> {
        let raw: Option<IndexMap<String, Value>> = Option::deserialize(d)?;
        raw.map(|r| {
            r.into_iter()
                .map(|(k, v)| decode(&k, &v).map(|x| (k, x)))
                .collect::<Result<SummaryRow, String>>()
                .map_err(D::Error::custom)
        })
        .transpose()
    }

    fn encode(v: f64) -> Value {
        if v.is_nan() {
            Value::from("NaN")
        } else if v == f64::INFINITY {
            Value::from("Infinity")
        } else if v == f64::NEG_INFINITY {
            Value::from("-Infinity")
        } else {
            Value::from(v)
        }
    }

    fn decode(name: &str, v: &Value) -> Result<f64, String> {
        match v {
            Value::Null => Ok(f64::NAN),
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| format!("summary cell '{}' is not a float: {}", name, n)),
            Value::String(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(format!("summary cell '{}' has invalid value '{}'", name, other)),
            },
            other => Err(format!("summary cell '{}' has invalid value {}", name, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalid_entries_names_non_finite_members() {
        let v = AnalysisValue::vector([("mean", 1.0), ("se", f64::NAN), ("t", f64::INFINITY)]);
        assert_eq!(v.invalid_entries(), vec!["se".to_string(), "t".to_string()]);
        assert_eq!(AnalysisValue::Scalar(f64::NAN).invalid_entries(), vec!["value"]);
        assert!(AnalysisValue::Scalar(0.5).invalid_entries().is_empty());
        let s = AnalysisValue::Structured(json!({"a": 1, "b": null}));
        assert_eq!(s.invalid_entries(), vec!["b".to_string()]);
        assert_eq!(AnalysisValue::Structured(Value::Null).invalid_entries(), vec!["value"]);
        assert!(AnalysisValue::Structured(json!(2.5)).invalid_entries().is_empty());
    }

    #[test]
    fn check_type_rejects_non_aggregates() {
        assert!(AnalysisValue::Structured(json!([1, 2])).check_type().is_ok());
        assert!(AnalysisValue::Structured(json!({"fit": {"b": 1}})).check_type().is_ok());
        let err = AnalysisValue::Structured(json!("converged"))
            .check_type()
            .expect_err("string");
        assert!(err.contains("string"), "{}", err);
        assert!(AnalysisValue::Structured(json!(true)).check_type().is_err());
        let number = AnalysisValue::Structured(json!(2.5));
        assert!(number.check_type().is_ok());
        assert_eq!(number.get("value"), Some(2.5));
    }

    #[test]
    fn rows_and_columns_follow_value_shape() {
        let set = ResultSet::new(vec![
            AnalysisResult {
                replication: 1,
                value: AnalysisValue::vector([("mean", 1.0), ("median", 2.0)]),
                errors: vec![],
                warnings: vec![],
            },
            AnalysisResult {
                replication: 2,
                value: AnalysisValue::vector([("mean", 3.0), ("median", 4.0)]),
                errors: vec![],
                warnings: vec![],
            },
        ]);
        assert_eq!(set.column("mean"), vec![1.0, 3.0]);
        assert!(set.column("missing").is_empty());
        let rows = set.rows();
        assert_eq!(rows[1].get("median"), Some(&json!(4.0)));
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(keys, vec!["mean", "median"]);

        let arr = AnalysisValue::Structured(json!([0.1, 0.2])).to_row();
        assert_eq!(arr.get("V2"), Some(&json!(0.2)));
    }

    #[test]
    fn tagged_serialization_is_stable() {
        let v = AnalysisValue::Scalar(2.5);
        let j = serde_json::to_value(&v).expect("ser");
        assert_eq!(j, json!({"kind": "scalar", "value": 2.5}));
        let back: AnalysisValue = serde_json::from_value(j).expect("de");
        assert_eq!(back, v);
    }
}
