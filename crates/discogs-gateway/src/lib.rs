// SPDX-License-Identifier: GPL-3.0-or-later

//! Rate-limited Discogs API gateway.
//!
//! Every request flows through one pipeline: a shared fixed-window limiter
//! admits it, the shaper adds the Discogs headers, the transport sends it and
//! the classifier turns the response into `Ok` or a typed [`GatewayError`].
//! Nothing is retried; callers decide what to do with throttling and faults.

pub mod classify;
pub mod client;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod rate_limiter;
pub mod shaper;
pub mod transport;

pub use client::{DiscogsClient, DiscogsClientBuilder};
pub use error::{BudgetError, GatewayError, Result, TransportError};
pub use models::{
    ClientIdentity, OutboundRequest, QuotaTelemetry, RawResponse, ResourceKind, TextFormat,
};
pub use pipeline::Pipeline;
pub use rate_limiter::{AdmissionControl, FixedWindowLimiter, Permit, PermitBudget, UnlimitedAdmission};
pub use shaper::RequestShaper;
pub use transport::{HttpTransport, ReqwestTransport};

pub use tokio_util::sync::CancellationToken;
