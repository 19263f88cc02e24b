//! Response agents: recognized text in, reply (whole or streamed) out.

use crate::error::VoiceResult;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// What an agent answers with.
pub enum AgentReply {
    /// A complete reply, spoken sentence by sentence.
    Text(String),
    /// Reply tokens as they are generated.
    Stream(BoxStream<'static, String>),
}

impl AgentReply {
    /// Reply fed from a channel, e.g. by a task reading an LLM stream.
    pub fn from_channel(rx: mpsc::Receiver<String>) -> Self {
        AgentReply::Stream(ReceiverStream::new(rx).boxed())
    }

    /// Reply from already-known tokens.
    pub fn from_tokens<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send + 'static,
    {
        AgentReply::Stream(stream::iter(tokens).boxed())
    }
}

impl std::fmt::Debug for AgentReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentReply::Text(text) => f.debug_tuple("Text").field(text).finish(),
            AgentReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Produces replies to recognized queries.
#[async_trait::async_trait]
pub trait ResponseAgent: Send + Sync {
    async fn respond(&self, query: &str) -> VoiceResult<AgentReply>;

    /// Abandon any reply in progress. Default: nothing to cancel.
    fn interrupt(&self) {}
}

/// Repeats the query back. Useful for wiring tests and demos.
#[derive(Debug, Default)]
pub struct EchoAgent;

#[async_trait::async_trait]
impl ResponseAgent for EchoAgent {
    async fn respond(&self, query: &str) -> VoiceResult<AgentReply> {
        Ok(AgentReply::Text(format!("你说的是：{}", query.trim())))
    }
}

/// Agent backed by a plain function.
pub struct FnAgent<F> {
    f: F,
}

impl<F> FnAgent<F>
where
    F: Fn(&str) -> VoiceResult<AgentReply> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F> ResponseAgent for FnAgent<F>
where
    F: Fn(&str) -> VoiceResult<AgentReply> + Send + Sync,
{
    async fn respond(&self, query: &str) -> VoiceResult<AgentReply> {
        (self.f)(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_agent() {
        match EchoAgent.respond(" 几点了 ").await.unwrap() {
            AgentReply::Text(text) => assert_eq!(text, "你说的是：几点了"),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channel_reply_streams_tokens() {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for token in ["今天", "天气", "不错。"] {
                tx.send(token.to_string()).await.unwrap();
            }
        });
        let AgentReply::Stream(stream) = AgentReply::from_channel(rx) else {
            panic!("expected a stream");
        };
        let tokens: Vec<String> = stream.collect().await;
        assert_eq!(tokens.concat(), "今天天气不错。");
    }

    #[tokio::test]
    async fn test_fn_agent() {
        let agent = FnAgent::new(|q: &str| Ok(AgentReply::from_tokens(vec![q.to_uppercase()])));
        let AgentReply::Stream(stream) = agent.respond("hi").await.unwrap() else {
            panic!("expected a stream");
        };
        assert_eq!(stream.collect::<Vec<_>>().await, vec!["HI".to_string()]);
    }
}
