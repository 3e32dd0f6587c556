//! # Data Retrieval Module
//!
//! The concrete HTTP collaborator used to fetch handshake credentials.
//!
//! - **`ky_http`**: an `ApiClient` built on `reqwest` and `reqwest-middleware`
//!   that implements `HttpPoster`. Retries are left to the credential
//!   fetcher, which owns the retry budget.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// HTTP client implementing the handshake poster.
pub mod ky_http;
