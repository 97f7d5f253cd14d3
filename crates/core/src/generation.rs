use anyhow::{anyhow, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message of a generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Either a finished value or a lazily produced sequence of partial values
pub enum Generation {
    Complete(Value),
    Stream(BoxStream<'static, Result<Value>>),
}

impl Generation {
    /// Drain the generation in order, aborting as soon as `cancel` fires.
    pub async fn collect(self, cancel: &CancellationToken) -> Result<Vec<Value>> {
        match self {
            Generation::Complete(value) => Ok(vec![value]),
            Generation::Stream(stream) => drain(stream, cancel).await,
        }
    }
}

#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, messages: Vec<Message>) -> Result<Generation>;
}

/// Pull every chunk from `stream`, preserving order.
pub async fn drain(
    mut stream: BoxStream<'static, Result<Value>>,
    cancel: &CancellationToken,
) -> Result<Vec<Value>> {
    let mut chunks = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(anyhow!("generation cancelled after {} chunks", chunks.len()));
            }
            next = stream.next() => match next {
                Some(chunk) => chunks.push(chunk?),
                None => return Ok(chunks),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let chunks: Vec<Result<Value>> = vec![Ok(json!("a")), Ok(json!("b")), Ok(json!("c"))];
        let generation = Generation::Stream(stream::iter(chunks).boxed());

        let values = generation.collect(&CancellationToken::new()).await.unwrap();
        assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_drain_stops_on_error_chunk() {
        let chunks: Vec<Result<Value>> = vec![Ok(json!(1)), Err(anyhow!("backend dropped")), Ok(json!(3))];
        let result = drain(stream::iter(chunks).boxed(), &CancellationToken::new()).await;
        assert!(result.unwrap_err().to_string().contains("backend dropped"));
    }

    #[tokio::test]
    async fn test_drain_aborts_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = drain(stream::pending::<Result<Value>>().boxed(), &cancel).await;
        assert!(result.unwrap_err().to_string().contains("cancelled"));
    }
}
