#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Turnstile
//!
//! Per-process request admission control: a token-bucket burst guard layered
//! over a sliding-window quota, keyed by caller identity and endpoint.
//!
//! ## Features
//!
//! - **Token bucket** burst protection with lazy elapsed-time refill
//! - **Sliding window** rolling quotas that never charge rejected requests
//! - **Policy table** mapping path prefixes to differentiated limits
//!   (anonymous vs authenticated), validated eagerly at startup
//! - **Identity resolution** from forwarded-IP headers or an upstream auth
//!   layer
//! - **Tower middleware** producing `429` responses with standard
//!   `X-RateLimit-*` headers
//! - **Deterministic tests** via a pluggable clock
//!
//! All state is in-memory and scoped to one process; horizontally scaled
//! deployments enforce independent per-instance quotas.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use turnstile::{AdmissionController, EndpointPolicy, PolicyTable};
//!
//! let table = PolicyTable::builder()
//!     .rule("/api/ai", EndpointPolicy::new(50, 200, 20, Duration::from_secs(60)))
//!     .build()
//!     .unwrap();
//! let controller = AdmissionController::new(table);
//!
//! let headers = http::HeaderMap::new();
//! let decision = controller.check(&headers, "/api/ai/analyze", Some("user-7"));
//! assert!(decision.allowed);
//! assert_eq!(decision.limit, 200);
//! ```

pub mod admission;
pub mod clock;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod sliding_window;
pub mod token_bucket;

// Re-exports
pub use admission::{AdmissionController, AdmissionDecision, AdmissionStats};
pub use clock::{Clock, ManualClock, WallClock};
pub use identity::{Identity, IdentityResolver};
pub use metrics::MetricsSnapshot;
pub use middleware::{AdmissionLayer, AdmissionService};
pub use policy::{EndpointPolicy, PolicyError, PolicyTable, PolicyTableBuilder};
