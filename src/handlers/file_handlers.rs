//! Command handlers for storing, fetching, listing and removing files.
//! Each one delegates to `GridFs` and prints a short result to stdout.

use anyhow::{Context, Result, bail};
use gridfs_store::{
    DecodeOptions, FileId, FileQuery, FindOptions, GridFs, Sort, SortKey, WritableFile,
};
use serde_json::Value;
use std::path::Path;

/// Arguments of `put`.
pub struct PutRequest<'a> {
    pub path: &'a Path,
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub id: Option<&'a str>,
    pub aliases: &'a [String],
    pub metadata: Option<&'a str>,
}

/// Store a local file, saving and validating it in one step.
pub async fn put(gridfs: &GridFs, req: PutRequest<'_>) -> Result<()> {
    let metadata = match req.metadata {
        Some(raw) => {
            let value: Value = serde_json::from_str(raw).context("parsing --metadata")?;
            match value {
                Value::Object(doc) => Some(doc),
                _ => bail!("--metadata must be a JSON object"),
            }
        }
        None => None,
    };

    let id = gridfs
        .with_new_file(req.path, async move |file: &mut WritableFile| {
            if let Some(id) = req.id {
                file.set_id(id)?;
            }
            if let Some(name) = req.filename {
                file.set_filename(name);
            }
            if let Some(content_type) = req.content_type {
                file.set_content_type(content_type);
            }
            for alias in req.aliases {
                file.add_alias(alias.clone());
            }
            if let Some(doc) = metadata {
                *file.metadata_mut() = doc;
            }
            Ok::<(), anyhow::Error>(())
        })
        .await?;

    tracing::info!(%id, path = %req.path.display(), "stored file");
    println!("{}", id);
    Ok(())
}

/// Write a stored file, chosen by id or by filename revision, to `dest`.
pub async fn get(
    gridfs: &GridFs,
    id: Option<&str>,
    filename: Option<&str>,
    revision: i64,
    dest: &Path,
) -> Result<()> {
    let file = match (id, filename) {
        (Some(id), _) => gridfs.find_one_by_id(id).await?,
        (None, Some(name)) => gridfs.find_revision(name, revision).await?,
        (None, None) => bail!("either --id or --filename is required"),
    };
    let file = file.context("no matching file")?;

    let written = file.write_to_path(dest).await?;
    println!("wrote {} bytes to {}", written, dest.display());
    Ok(())
}

/// Print every record matching the filter as one JSON line, by filename.
pub async fn list(gridfs: &GridFs, query: Option<&str>, rfc3339_dates: bool) -> Result<()> {
    let query = parse_query(query)?;
    let options = FindOptions {
        sort: Sort::ascending(SortKey::Filename),
        decode: if rfc3339_dates {
            DecodeOptions::rfc3339()
        } else {
            DecodeOptions::default()
        },
        ..FindOptions::default()
    };

    let mut cursor = gridfs.find_with(query, options).await?;
    while let Some(file) = cursor.next().await? {
        println!("{}", serde_json::to_string(&file.into_record())?);
    }
    Ok(())
}

pub async fn delete(
    gridfs: &GridFs,
    id: Option<&str>,
    filename: Option<&str>,
    query: Option<&str>,
) -> Result<()> {
    match (id, filename, query) {
        (Some(id), _, _) => gridfs.remove_by_id(id).await?,
        (None, Some(name), _) => gridfs.remove_by_filename(name).await?,
        (None, None, Some(raw)) => gridfs.remove(parse_query(Some(raw))?).await?,
        (None, None, None) => bail!("one of --id, --filename or --query is required"),
    }
    println!("removed");
    Ok(())
}

pub async fn rename(gridfs: &GridFs, id: &str, new_filename: &str) -> Result<()> {
    gridfs.rename(&FileId::from(id), new_filename).await?;
    println!("renamed {} to {}", id, new_filename);
    Ok(())
}

pub async fn validate(gridfs: &GridFs, id: &str) -> Result<()> {
    gridfs
        .validate(&FileId::from(id))
        .await
        .with_context(|| format!("validating {}", id))?;
    println!("{} ok", id);
    Ok(())
}

fn parse_query(raw: Option<&str>) -> Result<FileQuery> {
    match raw {
        Some(raw) => {
            let doc: Value = serde_json::from_str(raw).context("parsing --query")?;
            Ok(FileQuery::from_document(&doc)?)
        }
        None => Ok(FileQuery::All),
    }
}
