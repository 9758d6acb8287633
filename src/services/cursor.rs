//! Lazy, forward-only iteration over file records.

use crate::{
    errors::{GridFsError, GridFsResult},
    models::{
        file::{FileRecord, FileRow},
        metadata::DecodeOptions,
    },
    services::{
        gridfs::{FILE_COLUMNS, GridFs},
        query::{Direction, FileQuery, FindOptions, SortKey},
    },
};
use futures::{Stream, stream};
use sqlx::{QueryBuilder, sqlite::Sqlite};
use std::{collections::VecDeque, marker::PhantomData};

/// Item types a [`FileCursor`] can yield.
pub trait FromRecord: Sized {
    /// Wrap `record`, whose metadata was decoded with `decode`.
    fn from_record(record: FileRecord, bucket: &GridFs, decode: &DecodeOptions) -> Self;
}

impl FromRecord for FileRecord {
    fn from_record(record: FileRecord, _bucket: &GridFs, _decode: &DecodeOptions) -> Self {
        record
    }
}

/// Keyset position after the last row fetched.
#[derive(Debug, Clone)]
enum Position {
    Natural { seq: i64 },
    Text { key: String, seq: i64 },
    Int { key: i64, seq: i64 },
}

/// Cursor over the records matching a query.
///
/// Rows are fetched `batch_size` at a time. Only records that existed when
/// the cursor was opened are visible. The cursor cannot be rewound.
pub struct FileCursor<T> {
    bucket: GridFs,
    query: FileQuery,
    options: FindOptions,
    /// Highest `seq` present at open time.
    high_water: i64,
    position: Option<Position>,
    buffer: VecDeque<FileRecord>,
    returned: u64,
    exhausted: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T: FromRecord> FileCursor<T> {
    pub(crate) async fn open(
        bucket: GridFs,
        query: FileQuery,
        options: FindOptions,
    ) -> GridFsResult<Self> {
        let high_water: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(seq), 0) FROM {}",
            bucket.files_table()
        ))
        .fetch_one(bucket.pool())
        .await?;

        Ok(Self {
            bucket,
            query,
            options,
            high_water,
            position: None,
            buffer: VecDeque::new(),
            returned: 0,
            exhausted: options.limit == Some(0),
            _item: PhantomData,
        })
    }

    /// Advance to the next item, or `None` once the result set is consumed.
    pub async fn next(&mut self) -> GridFsResult<Option<T>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_batch().await?;
        }
        match self.buffer.pop_front() {
            Some(record) => {
                self.returned += 1;
                Ok(Some(T::from_record(record, &self.bucket, &self.options.decode)))
            }
            None => Ok(None),
        }
    }

    /// Drain the cursor into a vector.
    pub async fn try_collect(mut self) -> GridFsResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    pub fn into_stream(self) -> impl Stream<Item = GridFsResult<T>> {
        stream::try_unfold(self, |mut cursor| async move {
            let item = cursor.next().await?;
            Ok::<_, GridFsError>(item.map(|item| (item, cursor)))
        })
    }

    async fn fetch_batch(&mut self) -> GridFsResult<()> {
        let mut batch = u64::from(self.options.batch_size.max(1));
        if let Some(limit) = self.options.limit {
            let remaining = limit.saturating_sub(self.returned);
            if remaining == 0 {
                self.exhausted = true;
                return Ok(());
            }
            batch = batch.min(remaining);
        }

        // Past i64::MAX nothing can be skipped to or fetched.
        let offset = if self.position.is_none() { self.options.skip } else { 0 };
        let (Ok(offset), Ok(batch)) = (i64::try_from(offset), i64::try_from(batch)) else {
            self.exhausted = true;
            return Ok(());
        };

        let (cmp, order) = match self.options.sort.direction {
            Direction::Ascending => (">", "ASC"),
            Direction::Descending => ("<", "DESC"),
        };
        let key_expr = sort_expr(self.options.sort.key);

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE seq <= ",
            FILE_COLUMNS,
            self.bucket.files_table()
        ));
        builder.push_bind(self.high_water);
        builder.push(" AND (");
        self.query.push_sql(&mut builder);
        builder.push(")");

        match &self.position {
            None => {}
            Some(Position::Natural { seq }) => {
                builder.push(format!(" AND seq {} ", cmp));
                builder.push_bind(*seq);
            }
            Some(Position::Text { key, seq }) => {
                builder.push(format!(" AND ({}, seq) {} (", key_expr.unwrap_or("seq"), cmp));
                builder.push_bind(key.clone());
                builder.push(", ");
                builder.push_bind(*seq);
                builder.push(")");
            }
            Some(Position::Int { key, seq }) => {
                builder.push(format!(" AND ({}, seq) {} (", key_expr.unwrap_or("seq"), cmp));
                builder.push_bind(*key);
                builder.push(", ");
                builder.push_bind(*seq);
                builder.push(")");
            }
        }

        builder.push(" ORDER BY ");
        if let Some(expr) = key_expr {
            builder.push(format!("{} {}, ", expr, order));
        }
        builder.push(format!("seq {} LIMIT ", order));
        builder.push_bind(batch);
        if offset > 0 {
            builder.push(" OFFSET ");
            builder.push_bind(offset);
        }

        let rows: Vec<FileRow> = builder
            .build_query_as()
            .fetch_all(self.bucket.pool())
            .await?;

        if (rows.len() as i64) < batch {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.position = Some(position_of(self.options.sort.key, last));
        }
        for row in rows {
            self.buffer.push_back(row.into_record(&self.options.decode)?);
        }
        Ok(())
    }
}

fn sort_expr(key: SortKey) -> Option<&'static str> {
    match key {
        SortKey::Natural => None,
        SortKey::Filename => Some("COALESCE(filename, '')"),
        SortKey::UploadDate => Some("upload_date"),
    }
}

fn position_of(key: SortKey, row: &FileRow) -> Position {
    match key {
        SortKey::Natural => Position::Natural { seq: row.seq },
        SortKey::Filename => Position::Text {
            key: row.filename.clone().unwrap_or_default(),
            seq: row.seq,
        },
        SortKey::UploadDate => Position::Int {
            key: row.upload_date,
            seq: row.seq,
        },
    }
}
