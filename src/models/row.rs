use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// A single cell of a result row.
///
/// The variant is decided once, where the engine hands rows back, and is
/// never re-inferred further downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Nested(serde_json::Value),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Type-tagged textual form used when fingerprinting parameters.
    ///
    /// `Int(1)` and `Float(1.0)` and `Text("1")` all encode differently.
    pub fn canonical(&self) -> String {
        match self {
            CellValue::Null => "n".to_string(),
            CellValue::Bool(b) => format!("b:{}", b),
            CellValue::Int(i) => format!("i:{}", i),
            CellValue::Float(f) => format!("f:{:016x}", f.to_bits()),
            CellValue::Text(s) => format!("s:{}:{}", s.len(), s),
            CellValue::Nested(v) => format!("j:{}", v),
        }
    }

    pub fn into_json(self) -> serde_json::Value {
        match self {
            CellValue::Null => serde_json::Value::Null,
            CellValue::Bool(b) => serde_json::Value::Bool(b),
            CellValue::Int(i) => serde_json::Value::from(i),
            CellValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            CellValue::Text(s) => serde_json::Value::String(s),
            CellValue::Nested(v) => v,
        }
    }
}

impl From<serde_json::Value> for CellValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => CellValue::Null,
            serde_json::Value::Bool(b) => CellValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => CellValue::Int(i),
                None => n.as_f64().map(CellValue::Float).unwrap_or(CellValue::Null),
            },
            serde_json::Value::String(s) => CellValue::Text(s),
            nested => CellValue::Nested(nested),
        }
    }
}

/// One result row: column names paired with values, in result-set order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<(String, CellValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, column: impl Into<String>, value: CellValue) {
        self.values.push((column.into(), value));
    }

    /// First value stored under `column`
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.values.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keep only `columns`, in the order requested.
    ///
    /// Returns the first requested column that the row does not carry as the error.
    pub fn project(&self, columns: &[String]) -> Result<Row, String> {
        let mut projected = Row::with_capacity(columns.len());
        for column in columns {
            let value = self.get(column).ok_or_else(|| column.clone())?;
            projected.push(column.clone(), value.clone());
        }
        Ok(projected)
    }
}

impl FromIterator<(String, CellValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, CellValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_row() -> Row {
        let mut row = Row::new();
        row.push("id", CellValue::Int(7));
        row.push("name", CellValue::Text("Alice".to_string()));
        row.push("active", CellValue::Bool(true));
        row
    }

    #[test]
    fn test_row_serializes_in_column_order() {
        let encoded = serde_json::to_string(&sample_row()).unwrap();
        assert_eq!(encoded, r#"{"id":7,"name":"Alice","active":true}"#);
    }

    #[test]
    fn test_row_projection() {
        let row = sample_row();
        let projected = row
            .project(&["active".to_string(), "id".to_string()])
            .unwrap();
        assert_eq!(projected.column_names(), vec!["active", "id"]);

        let missing = row.project(&["email".to_string()]);
        assert_eq!(missing.unwrap_err(), "email");
    }

    #[test]
    fn test_cell_value_from_json() {
        assert_eq!(CellValue::from(json!(null)), CellValue::Null);
        assert_eq!(CellValue::from(json!(3)), CellValue::Int(3));
        assert_eq!(CellValue::from(json!(2.5)), CellValue::Float(2.5));
        assert_eq!(CellValue::from(json!("x")), CellValue::Text("x".to_string()));
        assert_eq!(
            CellValue::from(json!({"a": 1})),
            CellValue::Nested(json!({"a": 1}))
        );
    }

    #[test]
    fn test_params_deserialize_untagged() {
        let params: Vec<CellValue> = serde_json::from_str(r#"[1, 1.5, "a", null, true, [1]]"#).unwrap();
        assert_eq!(
            params,
            vec![
                CellValue::Int(1),
                CellValue::Float(1.5),
                CellValue::Text("a".to_string()),
                CellValue::Null,
                CellValue::Bool(true),
                CellValue::Nested(json!([1])),
            ]
        );
    }

    #[test]
    fn test_canonical_distinguishes_types() {
        let int = CellValue::Int(1).canonical();
        let float = CellValue::Float(1.0).canonical();
        let text = CellValue::Text("1".to_string()).canonical();
        assert_ne!(int, float);
        assert_ne!(int, text);
        assert_ne!(float, text);
    }
}
