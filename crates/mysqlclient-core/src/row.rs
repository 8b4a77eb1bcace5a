//! Fetched records.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConversionError;
use crate::value::Value;

/// Keys of a keyed record, shared by every row of one fetch.
///
/// A key may repeat when two columns resolve to the same qualified name; the
/// last column with that key wins on lookup, like assigning into a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create column info from resolved key names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Index of the column a key resolves to.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A record keyed by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a row with shared key metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Shared key metadata of this row.
    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by key.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.contains(name)
    }

    /// Get a typed value by key.
    pub fn get_named<T>(&self, name: &str) -> Result<T, ConversionError>
    where
        T: TryFrom<Value, Error = ConversionError>,
    {
        let value = self
            .get_by_name(name)
            .ok_or_else(|| ConversionError::new(format!("column '{name}' not found")))?;
        T::try_from(value.clone()).map_err(|mut e| {
            e.column = Some(name.to_string());
            e
        })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Iterate over (key, value) pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// One fetched record in the shape the caller asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Values in column order
    Tuple(Vec<Value>),
    /// Values keyed by column name
    Keyed(Row),
}

impl Record {
    pub fn len(&self) -> usize {
        match self {
            Record::Tuple(values) => values.len(),
            Record::Keyed(row) => row.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at a column position, whatever the shape.
    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            Record::Tuple(values) => values.get(index),
            Record::Keyed(row) => row.get(index),
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Record::Tuple(values) => Some(values),
            Record::Keyed(_) => None,
        }
    }

    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Record::Keyed(row) => Some(row),
            Record::Tuple(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(names: &[&str], values: Vec<Value>) -> Row {
        let info = Arc::new(ColumnInfo::new(
            names.iter().map(|s| (*s).to_string()).collect(),
        ));
        Row::with_columns(info, values)
    }

    #[test]
    fn test_row_lookup() {
        let row = keyed(&["id", "t2.id"], vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(row.get_by_name("id"), Some(&Value::Int(1)));
        assert_eq!(row.get_by_name("t2.id"), Some(&Value::Int(2)));
        assert_eq!(row.get_by_name("missing"), None);
        assert_eq!(row.get_named::<i64>("t2.id").unwrap(), 2);
    }

    #[test]
    fn test_repeated_key_last_wins() {
        let row = keyed(
            &["id", "t.id", "t.id"],
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        );
        assert_eq!(row.get_by_name("t.id"), Some(&Value::Int(3)));
        assert_eq!(row.len(), 3);
    }

    #[test]
    fn test_get_named_reports_column() {
        let row = keyed(&["name"], vec![Value::Text("x".to_string())]);
        let err = row.get_named::<i64>("name").unwrap_err();
        assert_eq!(err.column.as_deref(), Some("name"));
    }

    #[test]
    fn test_record_shapes() {
        let tuple = Record::Tuple(vec![Value::Null, Value::Int(5)]);
        assert_eq!(tuple.get(1), Some(&Value::Int(5)));
        assert!(tuple.as_row().is_none());

        let record = Record::Keyed(keyed(&["a"], vec![Value::Int(9)]));
        assert_eq!(record.len(), 1);
        assert_eq!(
            record.as_row().and_then(|r| r.get_by_name("a")),
            Some(&Value::Int(9))
        );
    }
}
