//! Typed file queries and their conversion to SQL.
//!
//! [`FileQuery::push_sql`] is total: every query value renders to a valid
//! predicate over a bucket's files table. Free-form JSON filters go through
//! [`FileQuery::from_document`], which rejects shapes it cannot express.

use crate::{
    errors::{GridFsError, GridFsResult},
    models::{file::FileId, metadata::{self, DecodeOptions}},
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use sqlx::{QueryBuilder, sqlite::Sqlite};

/// Dotted path into a record's metadata document, e.g. `owner.name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPath {
    segments: Vec<String>,
}

impl MetadataPath {
    /// Parse a dotted path. Segments must be non-empty and made of ASCII
    /// letters, digits, `_` or `-`.
    pub fn parse(path: &str) -> GridFsResult<Self> {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        for segment in &segments {
            if segment.is_empty()
                || !segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(GridFsError::InvalidQuery(format!(
                    "metadata path `{}` has an invalid segment",
                    path
                )));
            }
        }
        Ok(Self { segments })
    }

    /// SQLite JSON path, every label quoted.
    fn json_path(&self) -> String {
        let mut out = String::from("$");
        for segment in &self.segments {
            out.push_str(".\"");
            out.push_str(segment);
            out.push('"');
        }
        out
    }
}

/// A single JSON value a metadata field can be compared with.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    fn from_json(value: &Value) -> GridFsResult<Self> {
        match value {
            Value::Null => Ok(Scalar::Null),
            Value::Bool(b) => Ok(Scalar::Bool(*b)),
            Value::Number(num) => match num.as_i64() {
                Some(i) => Ok(Scalar::Int(i)),
                None => num.as_f64().map(Scalar::Float).ok_or_else(|| {
                    GridFsError::InvalidQuery(format!("number {} out of range", num))
                }),
            },
            Value::String(s) => Ok(Scalar::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => Err(GridFsError::Unsupported(
                "matching metadata against arrays or documents".into(),
            )),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Str(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Str(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// Predicate over the file records of a bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum FileQuery {
    All,
    Id(FileId),
    Filename(String),
    FilenamePrefix(String),
    ContentType(String),
    /// Record lists the alias among its aliases.
    Alias(String),
    Metadata { path: MetadataPath, value: Scalar },
    /// Uploaded at or after the instant.
    UploadedSince(DateTime<Utc>),
    /// Uploaded strictly before the instant.
    UploadedBefore(DateTime<Utc>),
    And(Vec<FileQuery>),
    Or(Vec<FileQuery>),
    Not(Box<FileQuery>),
}

impl FileQuery {
    pub fn id(id: impl Into<FileId>) -> Self {
        FileQuery::Id(id.into())
    }

    pub fn filename(name: impl Into<String>) -> Self {
        FileQuery::Filename(name.into())
    }

    /// Metadata equality on a dotted path.
    pub fn metadata(path: &str, value: impl Into<Scalar>) -> GridFsResult<Self> {
        Ok(FileQuery::Metadata {
            path: MetadataPath::parse(path)?,
            value: value.into(),
        })
    }

    pub fn and(self, other: FileQuery) -> Self {
        match self {
            FileQuery::And(mut clauses) => {
                clauses.push(other);
                FileQuery::And(clauses)
            }
            FileQuery::All => other,
            first => FileQuery::And(vec![first, other]),
        }
    }

    /// Append this query as a SQL predicate. Column names refer to the
    /// bucket's files table.
    pub fn push_sql<'args>(&self, builder: &mut QueryBuilder<'args, Sqlite>) {
        match self {
            FileQuery::All => {
                builder.push("1 = 1");
            }
            FileQuery::Id(id) => {
                builder.push("id = ");
                builder.push_bind(id.as_str().to_string());
            }
            FileQuery::Filename(name) => {
                builder.push("filename = ");
                builder.push_bind(name.clone());
            }
            FileQuery::FilenamePrefix(prefix) => {
                builder.push("instr(filename, ");
                builder.push_bind(prefix.clone());
                builder.push(") = 1");
            }
            FileQuery::ContentType(content_type) => {
                builder.push("content_type = ");
                builder.push_bind(content_type.clone());
            }
            FileQuery::Alias(alias) => {
                builder.push("EXISTS (SELECT 1 FROM json_each(aliases) WHERE json_each.value = ");
                builder.push_bind(alias.clone());
                builder.push(")");
            }
            FileQuery::Metadata { path, value } => push_metadata(builder, path, value),
            FileQuery::UploadedSince(at) => {
                builder.push("upload_date >= ");
                builder.push_bind(at.timestamp_millis());
            }
            FileQuery::UploadedBefore(at) => {
                builder.push("upload_date < ");
                builder.push_bind(at.timestamp_millis());
            }
            FileQuery::And(clauses) => push_joined(builder, clauses, " AND ", "1 = 1"),
            FileQuery::Or(clauses) => push_joined(builder, clauses, " OR ", "1 = 0"),
            FileQuery::Not(inner) => {
                // Missing fields compare as NULL; treat them as non-matching.
                builder.push("NOT COALESCE((");
                inner.push_sql(builder);
                builder.push("), 0)");
            }
        }
    }

    /// Parse a Mongo-style filter document.
    ///
    /// Recognised fields are `_id`, `filename`, `contentType`, `aliases`,
    /// `uploadDate` and `metadata.<path>`; operators `$eq`, `$ne`, `$in`,
    /// `$nin` on fields plus `$gt`/`$gte`/`$lt`/`$lte` on `uploadDate`, and
    /// top-level `$and`/`$or`.
    pub fn from_document(doc: &Value) -> GridFsResult<Self> {
        let map = doc.as_object().ok_or_else(|| {
            GridFsError::InvalidQuery("filter must be a JSON object".into())
        })?;

        let mut clauses = map
            .iter()
            .map(|(key, value)| parse_clause(key, value))
            .collect::<GridFsResult<Vec<_>>>()?;

        if clauses.len() > 1 {
            return Ok(FileQuery::And(clauses));
        }
        Ok(clauses.pop().unwrap_or(FileQuery::All))
    }
}

fn push_joined<'args>(
    builder: &mut QueryBuilder<'args, Sqlite>,
    clauses: &[FileQuery],
    separator: &str,
    empty: &str,
) {
    if clauses.is_empty() {
        builder.push(empty);
        return;
    }
    builder.push("(");
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 {
            builder.push(separator);
        }
        clause.push_sql(builder);
    }
    builder.push(")");
}

fn push_metadata<'args>(
    builder: &mut QueryBuilder<'args, Sqlite>,
    path: &MetadataPath,
    value: &Scalar,
) {
    let json_path = path.json_path();
    match value {
        Scalar::Null => {
            builder.push("json_extract(metadata, ");
            builder.push_bind(json_path);
            builder.push(") IS NULL");
        }
        Scalar::Bool(b) => {
            builder.push("json_type(metadata, ");
            builder.push_bind(json_path);
            builder.push(") = ");
            builder.push_bind(if *b { "true" } else { "false" });
        }
        Scalar::Int(i) => {
            builder.push("json_extract(metadata, ");
            builder.push_bind(json_path);
            builder.push(") = ");
            builder.push_bind(*i);
        }
        Scalar::Float(f) => {
            builder.push("json_extract(metadata, ");
            builder.push_bind(json_path);
            builder.push(") = ");
            builder.push_bind(*f);
        }
        Scalar::Str(s) => {
            builder.push("(json_type(metadata, ");
            builder.push_bind(json_path.clone());
            builder.push(") = 'text' AND json_extract(metadata, ");
            builder.push_bind(json_path);
            builder.push(") = ");
            builder.push_bind(s.clone());
            builder.push(")");
        }
    }
}

fn parse_clause(key: &str, value: &Value) -> GridFsResult<FileQuery> {
    match key {
        "$and" | "$or" => {
            let items = value.as_array().ok_or_else(|| {
                GridFsError::InvalidQuery(format!("`{}` expects an array of filters", key))
            })?;
            let clauses = items
                .iter()
                .map(FileQuery::from_document)
                .collect::<GridFsResult<Vec<_>>>()?;
            Ok(if key == "$and" {
                FileQuery::And(clauses)
            } else {
                FileQuery::Or(clauses)
            })
        }
        op if op.starts_with('$') => {
            Err(GridFsError::Unsupported(format!("query operator `{}`", op)))
        }
        "_id" => parse_field(value, |v| Ok(FileQuery::Id(expect_str(key, v)?.into()))),
        "filename" => parse_field(value, |v| Ok(FileQuery::Filename(expect_str(key, v)?))),
        "contentType" => parse_field(value, |v| Ok(FileQuery::ContentType(expect_str(key, v)?))),
        "aliases" => parse_field(value, |v| Ok(FileQuery::Alias(expect_str(key, v)?))),
        "uploadDate" => parse_upload_date(value),
        field => match field.strip_prefix("metadata.") {
            Some(path) => {
                let path = MetadataPath::parse(path)?;
                parse_field(value, |v| {
                    Ok(FileQuery::Metadata {
                        path: path.clone(),
                        value: Scalar::from_json(v)?,
                    })
                })
            }
            None => Err(GridFsError::Unsupported(format!(
                "query on field `{}`",
                field
            ))),
        },
    }
}

/// Expand a field's value, either a plain operand or an operator document.
fn parse_field<F>(value: &Value, leaf: F) -> GridFsResult<FileQuery>
where
    F: Fn(&Value) -> GridFsResult<FileQuery>,
{
    let Some(ops) = operator_document(value) else {
        return leaf(value);
    };

    let mut clauses = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let clause = match op.as_str() {
            "$eq" => leaf(operand)?,
            "$ne" => FileQuery::Not(Box::new(leaf(operand)?)),
            "$in" => FileQuery::Or(each(op, operand, &leaf)?),
            "$nin" => FileQuery::Not(Box::new(FileQuery::Or(each(op, operand, &leaf)?))),
            other => {
                return Err(GridFsError::Unsupported(format!(
                    "query operator `{}`",
                    other
                )));
            }
        };
        clauses.push(clause);
    }
    if clauses.len() > 1 {
        return Ok(FileQuery::And(clauses));
    }
    Ok(clauses.pop().unwrap_or(FileQuery::All))
}

fn each<F>(op: &str, operand: &Value, leaf: &F) -> GridFsResult<Vec<FileQuery>>
where
    F: Fn(&Value) -> GridFsResult<FileQuery>,
{
    operand
        .as_array()
        .ok_or_else(|| GridFsError::InvalidQuery(format!("`{}` expects an array", op)))?
        .iter()
        .map(leaf)
        .collect()
}

/// A non-empty object whose keys are all operators. `{"$date": ..}` is a
/// literal, not an operator document.
fn operator_document(value: &Value) -> Option<&Map<String, Value>> {
    value.as_object().filter(|map| {
        !map.is_empty() && !map.contains_key("$date") && map.keys().all(|k| k.starts_with('$'))
    })
}

fn parse_upload_date(value: &Value) -> GridFsResult<FileQuery> {
    let Some(ops) = operator_document(value) else {
        let at = expect_date(value)?;
        return Ok(FileQuery::And(vec![
            FileQuery::UploadedSince(at),
            FileQuery::UploadedBefore(next_millisecond(at)?),
        ]));
    };

    let mut clauses = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let at = expect_date(operand)?;
        clauses.push(match op.as_str() {
            "$gte" => FileQuery::UploadedSince(at),
            "$gt" => FileQuery::UploadedSince(next_millisecond(at)?),
            "$lt" => FileQuery::UploadedBefore(at),
            "$lte" => FileQuery::UploadedBefore(next_millisecond(at)?),
            other => {
                return Err(GridFsError::Unsupported(format!(
                    "operator `{}` on uploadDate",
                    other
                )));
            }
        });
    }
    if clauses.len() > 1 {
        return Ok(FileQuery::And(clauses));
    }
    Ok(clauses.pop().unwrap_or(FileQuery::All))
}

/// Upload dates have millisecond precision, so `> t` is `>= t + 1ms`.
fn next_millisecond(at: DateTime<Utc>) -> GridFsResult<DateTime<Utc>> {
    at.checked_add_signed(Duration::milliseconds(1))
        .ok_or_else(|| GridFsError::InvalidQuery(format!("uploadDate {} is out of range", at)))
}

fn expect_str(field: &str, value: &Value) -> GridFsResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| GridFsError::InvalidQuery(format!("`{}` expects a string", field)))
}

fn expect_date(value: &Value) -> GridFsResult<DateTime<Utc>> {
    metadata::as_date(value).ok_or_else(|| {
        GridFsError::InvalidQuery(format!("`{}` is not a date", value))
    })
}

/// Field a cursor orders by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    /// Insertion order.
    #[default]
    Natural,
    Filename,
    UploadDate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sort {
    pub key: SortKey,
    pub direction: Direction,
}

impl Sort {
    pub fn ascending(key: SortKey) -> Self {
        Self {
            key,
            direction: Direction::Ascending,
        }
    }

    pub fn descending(key: SortKey) -> Self {
        Self {
            key,
            direction: Direction::Descending,
        }
    }
}

pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Options for [`crate::GridFs::find_with`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FindOptions {
    pub sort: Sort,
    /// Records to skip before the first one returned.
    pub skip: u64,
    /// Maximum number of records returned.
    pub limit: Option<u64>,
    /// Rows fetched per round trip.
    pub batch_size: u32,
    pub decode: DecodeOptions,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            sort: Sort::default(),
            skip: 0,
            limit: None,
            batch_size: DEFAULT_BATCH_SIZE,
            decode: DecodeOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sql(query: &FileQuery) -> String {
        let mut builder = QueryBuilder::<Sqlite>::new("");
        query.push_sql(&mut builder);
        builder.sql().to_string()
    }

    #[test]
    fn renders_nested_boolean_queries() {
        let query = FileQuery::Or(vec![
            FileQuery::filename("a.txt"),
            FileQuery::And(vec![
                FileQuery::ContentType("text/plain".into()),
                FileQuery::Not(Box::new(FileQuery::Alias("old".into()))),
            ]),
        ]);
        assert_eq!(
            sql(&query),
            "(filename = ? OR (content_type = ? AND NOT COALESCE((EXISTS (SELECT 1 FROM json_each(aliases) WHERE json_each.value = ?)), 0)))"
        );
    }

    #[test]
    fn empty_combinators_are_constant() {
        assert_eq!(sql(&FileQuery::And(vec![])), "1 = 1");
        assert_eq!(sql(&FileQuery::Or(vec![])), "1 = 0");
    }

    #[test]
    fn metadata_path_is_quoted() {
        let path = MetadataPath::parse("owner.first-name").unwrap();
        assert_eq!(path.json_path(), "$.\"owner\".\"first-name\"");
        assert!(MetadataPath::parse("owner..name").is_err());
        assert!(MetadataPath::parse("owner.\"x").is_err());
    }

    #[test]
    fn parses_mongo_style_filter() {
        let query = FileQuery::from_document(&json!({
            "filename": { "$in": ["a", "b"] },
            "metadata.owner": "ana",
        }))
        .unwrap();
        assert_eq!(
            query,
            FileQuery::And(vec![
                FileQuery::Or(vec![FileQuery::filename("a"), FileQuery::filename("b")]),
                FileQuery::metadata("owner", "ana").unwrap(),
            ])
        );
    }

    #[test]
    fn parses_upload_date_range() {
        let query = FileQuery::from_document(&json!({
            "uploadDate": { "$gte": { "$date": 1000 }, "$lt": "1970-01-01T00:00:02Z" }
        }))
        .unwrap();
        assert_eq!(
            query,
            FileQuery::And(vec![
                FileQuery::UploadedSince(DateTime::from_timestamp_millis(1000).unwrap()),
                FileQuery::UploadedBefore(DateTime::from_timestamp_millis(2000).unwrap()),
            ])
        );
    }

    #[test]
    fn upload_date_at_the_last_instant_is_rejected() {
        let last = DateTime::<Utc>::MAX_UTC.timestamp_millis();
        for filter in [
            json!({ "uploadDate": { "$gt": { "$date": last } } }),
            json!({ "uploadDate": { "$lte": { "$date": last } } }),
            json!({ "uploadDate": { "$date": last } }),
        ] {
            let err = FileQuery::from_document(&filter).unwrap_err();
            assert!(matches!(err, GridFsError::InvalidQuery(_)), "{:?}", err);
        }

        let query = FileQuery::from_document(&json!({ "uploadDate": { "$gte": { "$date": last } } }))
            .unwrap();
        assert!(matches!(query, FileQuery::UploadedSince(_)));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert_eq!(FileQuery::from_document(&json!({})).unwrap(), FileQuery::All);
    }

    #[test]
    fn rejects_unknown_fields_and_operators() {
        let err = FileQuery::from_document(&json!({ "length": 10 })).unwrap_err();
        assert!(matches!(err, GridFsError::Unsupported(_)));

        let err = FileQuery::from_document(&json!({ "filename": { "$regex": "^a" } })).unwrap_err();
        assert!(matches!(err, GridFsError::Unsupported(_)));

        let err = FileQuery::from_document(&json!({ "$where": "1" })).unwrap_err();
        assert!(matches!(err, GridFsError::Unsupported(_)));

        let err = FileQuery::from_document(&json!({ "filename": 3 })).unwrap_err();
        assert!(matches!(err, GridFsError::InvalidQuery(_)));

        let err = FileQuery::from_document(&json!(["filename"])).unwrap_err();
        assert!(matches!(err, GridFsError::InvalidQuery(_)));
    }

    #[test]
    fn and_flattens() {
        let query = FileQuery::All
            .and(FileQuery::filename("a"))
            .and(FileQuery::ContentType("x".into()));
        assert_eq!(
            query,
            FileQuery::And(vec![
                FileQuery::filename("a"),
                FileQuery::ContentType("x".into())
            ])
        );
    }
}
