//! Reactive layer of the image-generation API test bench: debounced event
//! pipelines, the shared option caches and the key/endpoint sync rules,
//! driven by a single-owner core loop.

pub mod action;
pub mod api;
pub mod coordinator;
pub mod core;
pub mod debounce;
pub mod key_field;
pub mod options;
pub mod pipeline;
pub mod preview;
pub mod upload;
