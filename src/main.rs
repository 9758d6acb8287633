use anyhow::Result;
use gridfs_store::{GridFs, db};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod handlers;

use config::Command;
use handlers::{check_handlers, file_handlers};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config + command ---
    let (cfg, command) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting gridfs with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let pool = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Open bucket ---
    let gridfs = GridFs::open(pool, cfg.bucket_options()).await?;

    match command {
        Command::Put {
            path,
            filename,
            content_type,
            id,
            aliases,
            metadata,
        } => {
            file_handlers::put(
                &gridfs,
                file_handlers::PutRequest {
                    path: &path,
                    filename: filename.as_deref(),
                    content_type: content_type.as_deref(),
                    id: id.as_deref(),
                    aliases: &aliases,
                    metadata: metadata.as_deref(),
                },
            )
            .await
        }
        Command::Get {
            id,
            filename,
            revision,
            dest,
        } => file_handlers::get(&gridfs, id.as_deref(), filename.as_deref(), revision, &dest).await,
        Command::List {
            query,
            rfc3339_dates,
        } => file_handlers::list(&gridfs, query.as_deref(), rfc3339_dates).await,
        Command::Delete {
            id,
            filename,
            query,
        } => {
            file_handlers::delete(&gridfs, id.as_deref(), filename.as_deref(), query.as_deref())
                .await
        }
        Command::Rename { id, new_filename } => {
            file_handlers::rename(&gridfs, &id, &new_filename).await
        }
        Command::Validate { id } => file_handlers::validate(&gridfs, &id).await,
        Command::Check => check_handlers::check(&gridfs).await,
    }
}
