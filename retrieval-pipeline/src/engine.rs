use std::{pin::Pin, sync::Arc};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            book::Book,
            book_position::BookPosition,
            chunk::Chunk,
            conversation::{Conversation, SourceRef},
            system_settings::SystemSettings,
        },
    },
    utils::embedding::EmbeddingGateway,
};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    chat::ChatStream,
    prompt::{build_user_prompt, SYSTEM_PROMPT},
    vector::find_nearest_chunks,
};

/// Answer used when retrieval finds nothing, and when the model streams
/// only whitespace.
pub const FALLBACK_ANSWER: &str =
    "I don't have enough information from the text you've read so far.";

pub const DEFAULT_FAN_OUT: usize = 12;

pub type QueryEventStream = Pin<Box<dyn Stream<Item = QueryEvent> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub book_id: String,
    pub question: String,
    /// Spoiler ceiling override; falls back to the stored reading position.
    pub position_index: Option<i64>,
    pub model: Option<String>,
    pub ask_cfi: Option<String>,
    pub ask_chapter_index: Option<i64>,
    pub ask_chapter_percent: Option<f64>,
    pub ask_book_percent: Option<f64>,
}

/// Zero or more fragments followed by exactly one terminal event.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    Fragment(String),
    Done {
        answer: String,
        sources: Vec<SourceRef>,
    },
    Error(String),
}

/// Ask-time location recorded alongside the conversation.
#[derive(Debug, Clone, Default)]
struct AskContext {
    cfi: Option<String>,
    chapter_index: Option<i64>,
    chapter_percent: Option<f64>,
    book_percent: Option<f64>,
}

impl AskContext {
    /// Caller-supplied fields win; absent ones fall back to the stored
    /// reading position, with stored percents clamped to [0,100].
    fn resolve(request: &QueryRequest, stored: Option<&BookPosition>) -> Self {
        Self {
            cfi: request
                .ask_cfi
                .clone()
                .or_else(|| stored.and_then(|p| p.cfi.clone())),
            chapter_index: request
                .ask_chapter_index
                .or_else(|| stored.map(|p| p.chapter_index)),
            chapter_percent: request
                .ask_chapter_percent
                .or_else(|| stored.map(|p| p.chapter_percent))
                .map(|v| v.clamp(0.0, 100.0)),
            book_percent: request
                .ask_book_percent
                .or_else(|| stored.and_then(|p| p.book_percent))
                .map(|v| v.clamp(0.0, 100.0)),
        }
    }
}

pub struct QueryEngine {
    db: SurrealDbClient,
    gateway: Arc<EmbeddingGateway>,
    chat: Arc<dyn ChatStream>,
    fan_out: usize,
}

impl QueryEngine {
    pub fn new(
        db: SurrealDbClient,
        gateway: Arc<EmbeddingGateway>,
        chat: Arc<dyn ChatStream>,
    ) -> Self {
        Self {
            db,
            gateway,
            chat,
            fan_out: DEFAULT_FAN_OUT,
        }
    }

    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    /// Answer a question about a book, grounded only in chunks at or
    /// before the reader's position. Fails synchronously (`NotFound`,
    /// `InvalidState`, `RetrievalUnavailable`) before any stream exists;
    /// later failures surface as a terminal `Error` event.
    pub async fn ask(&self, request: QueryRequest) -> Result<QueryEventStream, AppError> {
        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(AppError::InvalidState("question must not be empty".into()));
        }

        Book::require(&request.book_id, &self.db).await?;

        let stored = BookPosition::get_for_book(&request.book_id, &self.db).await?;
        let position = request
            .position_index
            .or_else(|| stored.as_ref().map(|p| p.position_index))
            .ok_or_else(|| {
                AppError::InvalidState(format!(
                    "No reading position known for book {}",
                    request.book_id
                ))
            })?;
        let context = AskContext::resolve(&request, stored.as_ref());

        let model = match request.model.clone() {
            Some(model) => model,
            None => SystemSettings::ensure_initialized(&self.db).await?.qa_model,
        };

        let query_vector = self.gateway.embed_query(&question).await?;
        let hits =
            find_nearest_chunks(&self.db, &request.book_id, position, query_vector, self.fan_out)
                .await?;

        if hits.is_empty() {
            info!(book_id = %request.book_id, position, "no retrievable chunks, answering without model");
            let conversation = Conversation::new(
                request.book_id.clone(),
                question,
                FALLBACK_ANSWER.to_string(),
                model,
                position,
                context.cfi,
                context.chapter_index,
                context.chapter_percent,
                context.book_percent,
                Vec::new(),
            );
            self.db.store_item(conversation).await?;
            return Ok(futures::stream::iter([QueryEvent::Done {
                answer: FALLBACK_ANSWER.to_string(),
                sources: Vec::new(),
            }])
            .boxed());
        }

        let ids: Vec<String> = hits.into_iter().map(|hit| hit.chunk_id).collect();
        let chunks = Chunk::get_by_ids(&ids, &self.db).await?;
        let sources: Vec<SourceRef> = chunks.iter().map(SourceRef::from_chunk).collect();
        let user_prompt = build_user_prompt(&question, &chunks);

        let (tx, mut rx) = mpsc::channel::<QueryEvent>(32);
        let chat = Arc::clone(&self.chat);
        let db = self.db.clone();
        let book_id = request.book_id.clone();

        tokio::spawn(async move {
            let mut answer = String::new();
            let mut failure: Option<String> = None;

            match chat.stream_chat(&model, SYSTEM_PROMPT, &user_prompt).await {
                Ok(mut fragments) => {
                    while let Some(item) = fragments.next().await {
                        match item {
                            Ok(fragment) => {
                                answer.push_str(&fragment);
                                // A closed receiver means the caller went
                                // away; keep accumulating for persistence.
                                let _ = tx.send(QueryEvent::Fragment(fragment)).await;
                            }
                            Err(err) => {
                                failure = Some(err.to_string());
                                break;
                            }
                        }
                    }
                }
                Err(err) => failure = Some(err.to_string()),
            }

            if let Some(message) = failure {
                error!(%book_id, error = %message, "chat stream failed");
                // Whatever was streamed stays on record.
                if !answer.trim().is_empty() {
                    let conversation = Conversation::new(
                        book_id.clone(),
                        question,
                        answer,
                        model,
                        position,
                        context.cfi,
                        context.chapter_index,
                        context.chapter_percent,
                        context.book_percent,
                        sources,
                    );
                    if let Err(err) = db.store_item(conversation).await {
                        warn!(%book_id, error = %err, "failed to persist partial answer");
                    }
                }
                let _ = tx.send(QueryEvent::Error(message)).await;
                return;
            }

            let final_answer = if answer.trim().is_empty() {
                FALLBACK_ANSWER.to_string()
            } else {
                answer
            };

            let conversation = Conversation::new(
                book_id.clone(),
                question,
                final_answer.clone(),
                model,
                position,
                context.cfi,
                context.chapter_index,
                context.chapter_percent,
                context.book_percent,
                sources.clone(),
            );
            match db.store_item(conversation).await {
                Ok(_) => {
                    let _ = tx
                        .send(QueryEvent::Done {
                            answer: final_answer,
                            sources,
                        })
                        .await;
                }
                Err(err) => {
                    error!(%book_id, error = %err, "failed to persist conversation");
                    let _ = tx.send(QueryEvent::Error(err.to_string())).await;
                }
            }
        });

        Ok(Box::pin(async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }))
    }
}
