use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use gridfs_store::{BucketOptions, DEFAULT_BUCKET, DEFAULT_CHUNK_SIZE};
use std::{env, path::PathBuf};

/// Centralized CLI configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: String,
    pub bucket: String,
    pub chunk_size: u32,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "GridFS-style chunked file store on SQLite")]
pub struct Args {
    /// Database URL (overrides GRIDFS_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Bucket name (overrides GRIDFS_BUCKET)
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Chunk size in bytes for new files (overrides GRIDFS_CHUNK_SIZE)
    #[arg(long, global = true)]
    pub chunk_size: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Store a local file and print its id
    Put {
        path: PathBuf,
        /// Stored filename (defaults to the local file name)
        #[arg(long)]
        filename: Option<String>,
        #[arg(long)]
        content_type: Option<String>,
        /// Use this id instead of a generated one
        #[arg(long)]
        id: Option<String>,
        #[arg(long = "alias")]
        aliases: Vec<String>,
        /// Metadata document as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Write a stored file to a local path
    Get {
        #[arg(long, required_unless_present = "filename")]
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        filename: Option<String>,
        /// Revision when selecting by filename: 0 oldest, -1 newest
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        revision: i64,
        dest: PathBuf,
    },
    /// Print matching records as JSON lines
    List {
        /// Filter document, e.g. '{"metadata.owner": "ana"}'
        #[arg(long)]
        query: Option<String>,
        /// Render metadata dates as RFC 3339 strings
        #[arg(long)]
        rfc3339_dates: bool,
    },
    /// Remove files and their chunks
    #[command(group(ArgGroup::new("target").required(true).args(["id", "filename", "query"])))]
    Delete {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        filename: Option<String>,
        #[arg(long)]
        query: Option<String>,
    },
    /// Change a stored file's filename
    Rename { id: String, new_filename: String },
    /// Check one file's chunks against its record
    Validate { id: String },
    /// Ping the database and validate every file in the bucket
    Check,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        Self::resolve(Args::parse())
    }

    fn resolve(args: Args) -> Result<(Self, Command)> {
        // --- Environment fallback ---
        let env_db =
            env::var("GRIDFS_DATABASE_URL").unwrap_or_else(|_| "sqlite://./data/gridfs.db".into());
        let env_bucket = env::var("GRIDFS_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.into());
        let env_chunk_size = match env::var("GRIDFS_CHUNK_SIZE") {
            Ok(value) => value
                .parse::<u32>()
                .with_context(|| format!("parsing GRIDFS_CHUNK_SIZE value `{}`", value))?,
            Err(env::VarError::NotPresent) => DEFAULT_CHUNK_SIZE,
            Err(err) => return Err(err).context("reading GRIDFS_CHUNK_SIZE"),
        };

        // --- Merge ---
        let cfg = Self {
            database_url: args.database_url.unwrap_or(env_db),
            bucket: args.bucket.unwrap_or(env_bucket),
            chunk_size: args.chunk_size.unwrap_or(env_chunk_size),
        };

        Ok((cfg, args.command))
    }

    pub fn bucket_options(&self) -> BucketOptions {
        BucketOptions {
            bucket_name: self.bucket.clone(),
            chunk_size: self.chunk_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_environment() {
        let args = Args::try_parse_from([
            "gridfs",
            "--database-url",
            "sqlite://./tmp/test.db",
            "--bucket",
            "photos",
            "--chunk-size",
            "1024",
            "validate",
            "abc",
        ])
        .unwrap();
        let (cfg, command) = AppConfig::resolve(args).unwrap();
        assert_eq!(
            cfg,
            AppConfig {
                database_url: "sqlite://./tmp/test.db".into(),
                bucket: "photos".into(),
                chunk_size: 1024,
            }
        );
        assert_eq!(command, Command::Validate { id: "abc".into() });
    }

    #[test]
    fn put_collects_repeated_aliases() {
        let args = Args::try_parse_from([
            "gridfs", "put", "a.bin", "--alias", "x", "--alias", "y",
        ])
        .unwrap();
        match args.command {
            Command::Put { path, aliases, .. } => {
                assert_eq!(path, PathBuf::from("a.bin"));
                assert_eq!(aliases, vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn get_accepts_negative_revision() {
        let args = Args::try_parse_from([
            "gridfs", "get", "--filename", "a.txt", "--revision", "-2", "out.txt",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Command::Get {
                id: None,
                filename: Some("a.txt".into()),
                revision: -2,
                dest: PathBuf::from("out.txt"),
            }
        );
    }

    #[test]
    fn delete_requires_a_target() {
        assert!(Args::try_parse_from(["gridfs", "delete"]).is_err());
        assert!(Args::try_parse_from(["gridfs", "delete", "--id", "a", "--filename", "b"]).is_err());
    }
}
