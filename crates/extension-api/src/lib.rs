//! CogWorks Extension API client adapter.
//!
//! Implements [`pipeline::ports::DomainServiceClient`] over HTTP: each
//! registered domain service is a base URL, and a validation request is a JSON
//! `POST` to `{base}/v1/validate` answered with a
//! [`pipeline::ports::ValidationReport`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Endpoint registry, transport and serialisation live
//! here. The [`pipeline`] crate sees only
//! [`pipeline::ports::DomainServiceClient`].
//!
//! ## Failure classification
//!
//! | Condition | `recoverable` |
//! |-----------|---------------|
//! | connect error, timeout | `true` |
//! | HTTP 408, 429, 5xx | `true` |
//! | other HTTP 4xx | `false` |
//! | unknown service, undecodable report | `false` |

pub mod client;
pub mod config;

pub use client::HttpDomainServiceClient;
pub use config::{ExtensionConfig, ServiceEndpoint};

/// Errors raised while constructing the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtensionError {
    #[error("extension API configuration error: {0}")]
    Config(String),
}
