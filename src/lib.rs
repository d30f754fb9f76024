//! promptgate - Self-hosted gateway in front of an LLM generation backend.
//!
//! This library provides the request pipeline, admission control, content
//! guardrails, and persistence plumbing for the promptgate server.
//!
//! # Request Path
//!
//! Every chat request passes through the same stages:
//!
//! - **Admission:** per-client sliding-window rate limiting, backed by an
//!   in-process store or a shared Redis store.
//! - **Guardrail:** message length and keyword blocklist checks, applied
//!   before any upstream call.
//! - **Generation:** a single-shot or streaming exchange with an
//!   OpenAI-compatible backend.
//! - **Persistence:** request and violation records handed to a background
//!   sink without blocking the response.
//!
//! # Response Modes
//!
//! The non-streaming path returns the full completion in one JSON body.
//! The streaming path speaks SSE: `chunk` events as text arrives, then one
//! terminal `done` or `error` event.

pub mod backend;
pub mod config;
pub mod error;
pub mod guardrail;
pub mod identity;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod server;
pub mod sink;
pub mod trace;
