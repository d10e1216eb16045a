// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `agentuse-model` — the model-provider seam.
//!
//! The execution core talks to language models exclusively through the
//! [`ModelProvider`] trait: one streaming `complete()` call per turn.  The
//! wire protocol lives behind the trait; this crate ships an
//! OpenAI-compatible streaming driver (which covers OpenAI, OpenRouter,
//! Groq, Together, and any llama.cpp-style local server), a retry decorator
//! for transient failures, and deterministic mock providers for tests.

mod mock;
mod modelref;
mod openai_compat;
mod provider;
mod retry;
mod types;

pub use mock::{MockProvider, ScriptedMockProvider};
pub use modelref::{resolve_provider, DriverMeta, ModelRef, DRIVERS};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{ModelProvider, ResponseStream};
pub use retry::RetryProvider;
pub use types::{
    CompletionRequest, FunctionCall, Message, MessageContent, ResponseEvent, Role, ToolSchema,
    Usage,
};
