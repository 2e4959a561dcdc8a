use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::schema::FieldSchema;

/// Field name → value. `None` means missing; blank and unmentioned values
/// are both stored as `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldRecord {
    values: BTreeMap<String, Option<String>>,
}

impl FieldRecord {
    /// Record with every schema field present and missing.
    pub fn empty(schema: &FieldSchema) -> Self {
        Self { values: schema.fields().iter().map(|field| (field.clone(), None)).collect() }
    }

    /// Builds a partial record from raw oracle output. Keys outside the
    /// schema are dropped and blank values become missing.
    pub fn from_extraction<I, K, V>(schema: &FieldSchema, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut record = Self::empty(schema);
        for (key, value) in pairs {
            let key = key.as_ref().trim();
            if schema.contains(key) {
                record.set(key, value.as_ref());
            }
        }
        record
    }

    pub fn set(&mut self, field: &str, value: &str) {
        self.values.insert(field.to_string(), normalize_value(value));
    }

    /// Known (non-blank) value of `field`.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).and_then(|value| value.as_deref())
    }

    pub fn is_known(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn known_count(&self) -> usize {
        self.values.values().filter(|value| value.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.values.iter().map(|(field, value)| (field.as_str(), value.as_deref()))
    }
}

fn normalize_value(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::FieldRecord;
    use crate::domain::schema::FieldSchema;

    fn schema() -> FieldSchema {
        FieldSchema::new(["name", "price"]).expect("schema")
    }

    #[test]
    fn empty_record_lists_every_field_as_missing() {
        let record = FieldRecord::empty(&schema());
        assert_eq!(record.iter().count(), 2);
        assert_eq!(record.known_count(), 0);
    }

    #[test]
    fn extraction_drops_unknown_keys_and_blank_values() {
        let record = FieldRecord::from_extraction(
            &schema(),
            [("name", "  Widget "), ("price", "   "), ("colour", "red")],
        );

        assert_eq!(record.get("name"), Some("Widget"));
        assert!(!record.is_known("price"));
        assert_eq!(record.get("colour"), None);
        assert_eq!(record.iter().count(), 2);
    }

    #[test]
    fn serializes_as_plain_json_object() {
        let mut record = FieldRecord::empty(&schema());
        record.set("name", "Widget");

        let json = serde_json::to_string(&record).expect("serialize");
        assert_eq!(json, r#"{"name":"Widget","price":null}"#);

        let back: FieldRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
    }
}
