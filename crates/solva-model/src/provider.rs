// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, LlmError, ResponseEvent};

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<ResponseEvent, LlmError>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id for status display and error messages.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    ///
    /// When `req.stream` is false the provider still returns a stream, but
    /// one carrying the complete text as a single delta followed by usage
    /// and `Done`.
    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, LlmError>;
}
