use serde::Serialize;
use serde_json::{Map, Value};

/// Column name -> value mapping for one row image.
pub type RowImage = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Insert,
    Update,
    Delete,
}

impl RowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowKind::Insert => "insert",
            RowKind::Update => "update",
            RowKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for RowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a row event. Inserts and deletes carry one image; updates
/// carry the before and after images over the same column set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RowPayload {
    Values(RowImage),
    Update {
        before_values: RowImage,
        after_values: RowImage,
    },
}

impl RowPayload {
    /// The image a versioning sink writes: the single image for
    /// insert/delete, the after image for updates.
    pub fn sink_image(&self) -> &RowImage {
        match self {
            RowPayload::Values(values) => values,
            RowPayload::Update { after_values, .. } => after_values,
        }
    }
}

/// One row-level mutation, as delivered to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct RowEvent {
    pub kind: RowKind,
    pub schema: String,
    pub table: String,
    pub payload: RowPayload,
}

impl RowEvent {
    pub fn insert(schema: impl Into<String>, table: impl Into<String>, values: RowImage) -> RowEvent {
        RowEvent {
            kind: RowKind::Insert,
            schema: schema.into(),
            table: table.into(),
            payload: RowPayload::Values(values),
        }
    }

    pub fn update(
        schema: impl Into<String>,
        table: impl Into<String>,
        before_values: RowImage,
        after_values: RowImage,
    ) -> RowEvent {
        RowEvent {
            kind: RowKind::Update,
            schema: schema.into(),
            table: table.into(),
            payload: RowPayload::Update {
                before_values,
                after_values,
            },
        }
    }

    pub fn delete(schema: impl Into<String>, table: impl Into<String>, values: RowImage) -> RowEvent {
        RowEvent {
            kind: RowKind::Delete,
            schema: schema.into(),
            table: table.into(),
            payload: RowPayload::Values(values),
        }
    }
}

/// Builds a row image from parallel column/value slices.
pub fn image_from_columns(columns: &[String], values: Vec<Value>) -> RowImage {
    columns.iter().cloned().zip(values).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_strings() {
        assert_eq!(RowKind::Insert.as_str(), "insert");
        assert_eq!(RowKind::Update.to_string(), "update");
        assert_eq!(RowKind::Delete.as_str(), "delete");
    }

    #[test]
    fn image_zips_columns_and_values() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let image = image_from_columns(&columns, vec![json!(1), json!("a")]);
        assert_eq!(image.get("id"), Some(&json!(1)));
        assert_eq!(image.get("name"), Some(&json!("a")));
    }

    #[test]
    fn update_sink_image_is_after() {
        let before = image_from_columns(&["id".into(), "v".into()], vec![json!(1), json!(2)]);
        let after = image_from_columns(&["id".into(), "v".into()], vec![json!(1), json!(102)]);
        let event = RowEvent::update("db", "items", before, after.clone());
        assert_eq!(event.payload.sink_image(), &after);
    }
}
