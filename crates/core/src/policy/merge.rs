use crate::domain::record::FieldRecord;
use crate::domain::schema::FieldSchema;

/// Monotonic fill: a known value in `partial` wins, otherwise `old` is kept.
/// A known field can never become missing through a merge.
pub fn merge(schema: &FieldSchema, old: &FieldRecord, partial: &FieldRecord) -> FieldRecord {
    let mut merged = old.clone();
    for field in schema.fields() {
        match partial.get(field) {
            Some(value) => merged.set(field, value),
            None if old.get(field).is_none() => merged.set(field, ""),
            None => {}
        }
    }
    merged
}
