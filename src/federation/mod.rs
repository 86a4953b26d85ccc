//! Federation allow-list and the per-request federation check.
//!
//! [`FederationAllowList`] is the periodic cache engine configured for the
//! partner directory of the registration service. [`FederationGate`]
//! compares the `X-Matrix` claim of a request against it.
//!
//! # Example
//!
//! ```ignore
//! use tim_gateway::federation::{FederationAllowList, FederationGate, GateMode};
//!
//! let (allow_list, engine) = FederationAllowList::open(&config.federation_list, audit.clone())?;
//! tokio::spawn(engine.run());
//!
//! let gate = FederationGate::new(GateMode::Inbound, allow_list, true, audit);
//! gate.authorize(req.headers(), req.uri().path())?;
//! ```

mod allow_list;
mod error;
mod gate;
mod header;

pub use allow_list::{FederationAllowList, FederationDirectory, FederationDomain, FederationListSource};
pub use error::FederationError;
pub use gate::{FederationGate, GateMode, GateRejection};
pub use header::{X_MATRIX_SCHEME, clean_domain, x_matrix_param};
