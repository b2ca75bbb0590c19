use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use common::error::AppError;
use futures::{stream::BoxStream, StreamExt};

/// Streaming chat capability. The engine only needs incremental text
/// fragments, so the seam is a trait and tests inject scripted streams.
#[async_trait]
pub trait ChatStream: Send + Sync {
    async fn stream_chat(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<BoxStream<'static, Result<String, AppError>>, AppError>;
}

pub struct OpenAiChat {
    client: Arc<Client<OpenAIConfig>>,
}

impl OpenAiChat {
    pub fn new(client: Arc<Client<OpenAIConfig>>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatStream for OpenAiChat {
    async fn stream_chat(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<BoxStream<'static, Result<String, AppError>>, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system_prompt)
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user_prompt)
                    .build()?
                    .into(),
            ])
            .build()?;

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|err| AppError::Upstream(err.to_string()))?;

        let fragments = stream.filter_map(|item| async move {
            match item {
                Ok(response) => response
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone())
                    .map(Ok),
                Err(err) => Some(Err(AppError::Upstream(err.to_string()))),
            }
        });

        Ok(fragments.boxed())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[derive(Clone)]
    pub enum ScriptedItem {
        Text(&'static str),
        Fail(&'static str),
    }

    /// Replays a fixed fragment script and counts how often it was called.
    pub struct ScriptedChat {
        script: Vec<ScriptedItem>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedChat {
        pub fn new(script: Vec<ScriptedItem>) -> Self {
            Self {
                script,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn call_counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }
    }

    #[async_trait]
    impl ChatStream for ScriptedChat {
        async fn stream_chat(
            &self,
            _model: &str,
            _system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<BoxStream<'static, Result<String, AppError>>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let items: Vec<Result<String, AppError>> = self
                .script
                .iter()
                .map(|item| match item {
                    ScriptedItem::Text(text) => Ok((*text).to_string()),
                    ScriptedItem::Fail(message) => {
                        Err(AppError::Upstream((*message).to_string()))
                    }
                })
                .collect();
            Ok(futures::stream::iter(items).boxed())
        }
    }
}
