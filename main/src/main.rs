use std::{
    io::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_openai::Client;
use clap::{Parser, Subcommand};
use common::{
    storage::{
        db::SurrealDbClient,
        reconciler,
        types::{
            book::Book,
            book_position::{BookPosition, PositionUpdate},
            bookmark::Bookmark,
            chunk::Chunk,
            conversation::Conversation,
        },
    },
    utils::{
        config::{get_config, AppConfig},
        embedding::{EmbeddingGateway, EmbeddingProvider},
        token_estimate::{HeuristicEstimator, TokenEstimate},
    },
};
use futures::StreamExt;
use ingestion_pipeline::{estimator::HfTokenizerEstimator, ExtractedChapter, IngestionPipeline};
use retrieval_pipeline::{search_chunks, OpenAiChat, QueryEngine, QueryEvent, QueryRequest};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "bookworm", about = "Spoiler-safe reading companion", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a book from extracted chapter text (.json chapter list or a
    /// single plain-text file)
    Import {
        path: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long)]
        author: String,
    },
    /// Ask a question about a book, streaming the answer
    Ask {
        book_id: String,
        question: String,
        #[arg(long)]
        position: Option<i64>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Update the reading position for a book
    Position {
        book_id: String,
        #[arg(long)]
        chapter: Option<i64>,
        #[arg(long, default_value_t = 0.0)]
        chapter_percent: f64,
        #[arg(long)]
        book_percent: Option<f64>,
        #[arg(long)]
        cfi: Option<String>,
    },
    /// Search within the text already read
    Search {
        book_id: String,
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List imported books
    Books,
    /// Show a book's question history
    History { book_id: String },
    /// Toggle a bookmark at a citation token
    Bookmark {
        book_id: String,
        cfi: String,
        #[arg(long)]
        chapter: Option<i64>,
        #[arg(long)]
        chapter_percent: Option<f64>,
        #[arg(long)]
        book_percent: Option<f64>,
        #[arg(long)]
        label: Option<String>,
    },
    /// List a book's bookmarks
    Bookmarks { book_id: String },
    /// Remove a bookmark by id
    Unbookmark { bookmark_id: String },
    /// Store reading-surface citation ranges from a JSON file of
    /// {"chunk_id": ..., "cfi_range": ...} entries
    UpdateCfis { book_id: String, path: PathBuf },
    /// Delete a book and everything belonging to it
    Delete { book_id: String },
}

#[derive(Deserialize)]
struct ChapterFile {
    title: Option<String>,
    spine_href: Option<String>,
    text: String,
}

#[derive(Deserialize)]
struct CfiEntry {
    chunk_id: String,
    cfi_range: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = get_config().context("loading configuration")?;

    let db = SurrealDbClient::new(
        &config.surrealdb_address,
        &config.surrealdb_username,
        &config.surrealdb_password,
        &config.surrealdb_namespace,
        &config.surrealdb_database,
    )
    .await
    .context("connecting to surrealdb")?;

    let openai_client = openai_client(&config);
    let provider = EmbeddingProvider::from_config(&config, openai_client.clone())?;
    db.ensure_initialized(provider.dimension()).await?;

    let report = reconciler::reconcile(&db).await?;
    if report.backfilled_chunks > 0 || report.invalidated_citations {
        info!(
            backfilled = report.backfilled_chunks,
            invalidated = report.invalidated_citations,
            "startup reconciliation complete"
        );
    }

    let estimator = token_estimator(&config)?;
    let gateway = EmbeddingGateway::new(provider, Arc::clone(&estimator));

    match cli.command {
        Command::Import {
            path,
            title,
            author,
        } => {
            let chapters = load_chapters(&path)?;
            let pipeline = IngestionPipeline::new(db, gateway, estimator);
            let outcome = pipeline.import_book(&title, &author, chapters).await?;
            println!(
                "Imported '{}' as {} ({} chunks across {} chapters)",
                title, outcome.book_id, outcome.total_chunks, outcome.chapter_count
            );
        }
        Command::Ask {
            book_id,
            question,
            position,
            model,
        } => {
            let client = openai_client.context(
                "the ask command needs an OpenAI client; set openai_api_key",
            )?;
            let engine =
                QueryEngine::new(db, Arc::new(gateway), Arc::new(OpenAiChat::new(client)));
            let mut stream = engine
                .ask(QueryRequest {
                    book_id,
                    question,
                    position_index: position,
                    model,
                    ..QueryRequest::default()
                })
                .await?;

            let mut stdout = std::io::stdout();
            while let Some(event) = stream.next().await {
                match event {
                    QueryEvent::Fragment(fragment) => {
                        write!(stdout, "{fragment}")?;
                        stdout.flush()?;
                    }
                    QueryEvent::Done { sources, .. } => {
                        writeln!(stdout)?;
                        for source in sources {
                            writeln!(
                                stdout,
                                "  [{}] ch {} pos {}: {}",
                                source.chunk_id,
                                source.chapter_index + 1,
                                source.position_index,
                                source.anchor_text.unwrap_or(source.snippet)
                            )?;
                        }
                    }
                    QueryEvent::Error(message) => {
                        writeln!(stdout)?;
                        anyhow::bail!("query failed: {message}");
                    }
                }
            }
        }
        Command::Position {
            book_id,
            chapter,
            chapter_percent,
            book_percent,
            cfi,
        } => {
            let position = BookPosition::set_for_book(
                &book_id,
                PositionUpdate {
                    chapter_index: chapter,
                    chapter_percent,
                    book_percent,
                    cfi,
                },
                &db,
            )
            .await?;
            println!(
                "Position updated: chapter {} at {:.1}% -> position index {}",
                position.chapter_index, position.chapter_percent, position.position_index
            );
        }
        Command::Search {
            book_id,
            query,
            limit,
        } => {
            let matches = search_chunks(&db, &book_id, &query, limit).await?;
            if matches.is_empty() {
                println!("No matches.");
            }
            for m in matches {
                let canonical = match (m.canonical_start, m.canonical_end) {
                    (Some(start), Some(end)) => format!("canonical {start}..{end}"),
                    _ => "canonical unknown".to_string(),
                };
                println!(
                    "ch {} pos {} bytes {}..{} ({}): {}",
                    m.chapter_index + 1,
                    m.position_index,
                    m.offset_start,
                    m.offset_end,
                    canonical,
                    m.snippet
                );
            }
        }
        Command::Books => {
            for book in Book::list(&db).await? {
                let position = BookPosition::get_for_book(&book.id, &db).await?;
                let progress = match position {
                    Some(p) => p
                        .book_percent
                        .map(|percent| format!("{percent:.1}% read"))
                        .unwrap_or_else(|| "in progress".to_string()),
                    None => "not started".to_string(),
                };
                println!(
                    "{}  {} by {} [{:?}] {} chunks, {}",
                    book.id, book.title, book.author, book.status, book.total_chunks, progress
                );
            }
        }
        Command::History { book_id } => {
            for conversation in Conversation::list_for_book(&book_id, &db).await? {
                println!("Q: {}", conversation.question);
                println!("A: {}", conversation.answer);
                println!(
                    "   (position {}, {} sources)\n",
                    conversation.position_index,
                    conversation.sources.len()
                );
            }
        }
        Command::Bookmark {
            book_id,
            cfi,
            chapter,
            chapter_percent,
            book_percent,
            label,
        } => {
            match Bookmark::toggle(
                &book_id,
                &cfi,
                chapter,
                chapter_percent,
                book_percent,
                label,
                &db,
            )
            .await?
            {
                Some(bookmark) => println!("Bookmarked {} ({})", bookmark.cfi, bookmark.id),
                None => println!("Bookmark removed."),
            }
        }
        Command::Bookmarks { book_id } => {
            for bookmark in Bookmark::list_for_book(&book_id, &db).await? {
                let progress = bookmark
                    .book_percent
                    .map(|percent| format!("{percent:.1}%"))
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "{}  {}  {}{}",
                    bookmark.id,
                    progress,
                    bookmark.cfi,
                    bookmark
                        .label
                        .map(|l| format!("  ({l})"))
                        .unwrap_or_default()
                );
            }
        }
        Command::Unbookmark { bookmark_id } => {
            Bookmark::delete(&bookmark_id, &db).await?;
            println!("Bookmark removed.");
        }
        Command::UpdateCfis { book_id, path } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let entries: Vec<CfiEntry> =
                serde_json::from_str(&raw).context("parsing cfi entries")?;
            let updates: Vec<(String, Option<String>)> = entries
                .into_iter()
                .map(|e| (e.chunk_id, e.cfi_range))
                .collect();
            let updated = Chunk::set_cfi_ranges(&book_id, &updates, &db).await?;
            println!("Updated {updated} chunk citation ranges.");
        }
        Command::Delete { book_id } => {
            Book::delete_with_children(&book_id, &db).await?;
            println!("Deleted {book_id} and all related data.");
        }
    }

    Ok(())
}

fn openai_client(
    config: &AppConfig,
) -> Option<Arc<Client<async_openai::config::OpenAIConfig>>> {
    if config.openai_api_key.is_empty() {
        return None;
    }
    let openai_config = async_openai::config::OpenAIConfig::new()
        .with_api_key(config.openai_api_key.clone())
        .with_api_base(config.openai_base_url.clone());
    Some(Arc::new(Client::with_config(openai_config)))
}

fn token_estimator(config: &AppConfig) -> Result<Arc<dyn TokenEstimate>> {
    match &config.tokenizer_file {
        Some(path) => Ok(Arc::new(HfTokenizerEstimator::from_file(path)?)),
        None => Ok(Arc::new(HeuristicEstimator)),
    }
}

/// Chapters come pre-extracted: either a JSON list of
/// `{title, spine_href, text}` objects or a single plain-text file.
fn load_chapters(path: &Path) -> Result<Vec<ExtractedChapter>> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    if path.extension().is_some_and(|ext| ext == "json") {
        let chapters: Vec<ChapterFile> =
            serde_json::from_str(&raw).context("parsing chapter list")?;
        Ok(chapters
            .into_iter()
            .map(|c| ExtractedChapter {
                title: c.title,
                spine_href: c.spine_href,
                text: c.text,
            })
            .collect())
    } else {
        Ok(vec![ExtractedChapter {
            title: None,
            spine_href: None,
            text: raw,
        }])
    }
}
