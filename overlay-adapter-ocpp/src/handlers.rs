//! Application handlers for requests addressed to this node

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use overlay_core::{BinaryRequest, ErrorCode, JsonRequest};
use serde_json::Value;

/// Answer to a JSON request
#[derive(Debug, Clone)]
pub enum Reply {
    Response(Value),
    Error {
        code: ErrorCode,
        description: String,
        details: Value,
    },
}

impl Reply {
    pub fn error(code: ErrorCode, description: impl Into<String>) -> Self {
        Reply::Error {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }
}

/// Answer to a binary request
#[derive(Debug, Clone)]
pub enum BinaryReply {
    Response(Bytes),
    Error { code: ErrorCode, description: String },
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: JsonRequest) -> Reply;
}

#[async_trait]
pub trait BinaryRequestHandler: Send + Sync {
    async fn handle(&self, request: BinaryRequest) -> BinaryReply;
}

/// Handler backed by an async closure
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`RequestHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JsonRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Reply> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(JsonRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Reply> + Send,
{
    async fn handle(&self, request: JsonRequest) -> Reply {
        (self.0)(request).await
    }
}

/// Binary handler backed by an async closure
pub struct BinaryFnHandler<F>(F);

pub fn binary_handler_fn<F, Fut>(f: F) -> BinaryFnHandler<F>
where
    F: Fn(BinaryRequest) -> Fut + Send + Sync,
    Fut: Future<Output = BinaryReply> + Send,
{
    BinaryFnHandler(f)
}

#[async_trait]
impl<F, Fut> BinaryRequestHandler for BinaryFnHandler<F>
where
    F: Fn(BinaryRequest) -> Fut + Send + Sync,
    Fut: Future<Output = BinaryReply> + Send,
{
    async fn handle(&self, request: BinaryRequest) -> BinaryReply {
        (self.0)(request).await
    }
}
