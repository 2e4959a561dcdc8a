use crate::domain::record::FieldRecord;
use crate::domain::schema::FieldSchema;

/// Every schema field has a known value. Values are trusted verbatim.
pub fn is_complete(schema: &FieldSchema, record: &FieldRecord) -> bool {
    schema.fields().iter().all(|field| record.is_known(field))
}

/// Schema fields without a known value, in schema order.
pub fn missing_fields(schema: &FieldSchema, record: &FieldRecord) -> Vec<String> {
    schema.fields().iter().filter(|field| !record.is_known(field)).cloned().collect()
}
