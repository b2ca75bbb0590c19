pub mod chat;
pub mod engine;
pub mod prompt;
pub mod search;
pub mod vector;

pub use chat::{ChatStream, OpenAiChat};
pub use engine::{
    QueryEngine, QueryEvent, QueryEventStream, QueryRequest, DEFAULT_FAN_OUT, FALLBACK_ANSWER,
};
pub use search::{search_chunks, SearchMatch};
