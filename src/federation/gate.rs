//! Per-request federation authorization.
//!
//! Every gated request must carry an `X-Matrix` authorization header whose
//! `origin` (inbound) or `destination` (outbound) parameter names a domain
//! from the federation allow-list.

use std::fmt;
use std::sync::Arc;

use hyper::{HeaderMap, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace};

use super::allow_list::FederationAllowList;
use super::header::{clean_domain, x_matrix_param};
use crate::telemetry::{AuditEvent, AuditLogger, DenyCause};

/// Direction of the traffic being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Requests arriving from the federation; the `origin` claim is checked.
    Inbound,
    /// Requests leaving towards the federation; the `destination` claim is checked.
    Outbound,
}

impl GateMode {
    /// Authorization header parameter holding the claim for this direction.
    pub fn param_name(self) -> &'static str {
        match self {
            GateMode::Inbound => "origin",
            GateMode::Outbound => "destination",
        }
    }
}

impl fmt::Display for GateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateMode::Inbound => write!(f, "inbound"),
            GateMode::Outbound => write!(f, "outbound"),
        }
    }
}

/// Why a request failed the federation check.
///
/// The display text is the client-visible error message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateRejection {
    /// No `X-Matrix` header, or no parameter for this direction.
    #[error("missing X-Matrix authorization header with {param} field")]
    MissingCredentials {
        /// The expected parameter name.
        param: &'static str,
    },

    /// The claimed domain is not in the allow-list.
    #[error("not part of federation")]
    NotFederated {
        /// The cleaned domain that was looked up.
        domain: String,
    },
}

impl GateRejection {
    /// HTTP status for the deny response.
    pub fn status(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }

    /// Matrix error code for the deny response.
    pub fn errcode(&self) -> &'static str {
        "M_UNAUTHORIZED"
    }

    /// Audit classification.
    pub fn cause(&self) -> DenyCause {
        match self {
            GateRejection::MissingCredentials { .. } => DenyCause::MissingCredentials,
            GateRejection::NotFederated { .. } => DenyCause::NotFederated,
        }
    }

    fn domain(&self) -> Option<String> {
        match self {
            GateRejection::MissingCredentials { .. } => None,
            GateRejection::NotFederated { domain } => Some(domain.clone()),
        }
    }
}

/// Federation check for one gateway direction.
#[derive(Debug, Clone)]
pub struct FederationGate {
    mode: GateMode,
    allow_list: FederationAllowList,
    enforce: bool,
    audit: Arc<AuditLogger>,
}

impl FederationGate {
    /// Create a gate. With `enforce = false` every request passes, but the
    /// decision is still evaluated, logged and audited.
    pub fn new(
        mode: GateMode,
        allow_list: FederationAllowList,
        enforce: bool,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            mode,
            allow_list,
            enforce,
            audit,
        }
    }

    /// Direction this gate checks.
    pub fn mode(&self) -> GateMode {
        self.mode
    }

    /// Whether denials are enforced.
    pub fn is_enforced(&self) -> bool {
        self.enforce
    }

    /// Decide without side effects. Returns the cleaned, allowed domain.
    pub fn evaluate(&self, headers: &HeaderMap) -> Result<String, GateRejection> {
        let param = self.mode.param_name();
        let claimed =
            x_matrix_param(headers, param).ok_or(GateRejection::MissingCredentials { param })?;
        let domain = clean_domain(&claimed);
        if self.allow_list.contains(&domain) {
            Ok(domain)
        } else {
            Err(GateRejection::NotFederated { domain })
        }
    }

    /// Check a request, log and audit the outcome.
    ///
    /// `target` is only used for log context (the request path).
    pub fn authorize(&self, headers: &HeaderMap, target: &str) -> Result<(), GateRejection> {
        match self.evaluate(headers) {
            Ok(domain) => {
                trace!("{} federation check passed for {} ({})", self.mode, domain, target);
                self.audit.log(AuditEvent::FederationAllow {
                    mode: self.mode,
                    domain,
                });
                Ok(())
            }
            Err(rejection) => {
                self.audit.log(AuditEvent::FederationDeny {
                    mode: self.mode,
                    domain: rejection.domain(),
                    reason: rejection.cause(),
                    enforced: self.enforce,
                });
                if self.enforce {
                    info!(
                        "{} authorization failed for {}: {}",
                        self.mode, target, rejection
                    );
                    Err(rejection)
                } else {
                    debug!(
                        "{} authorization would fail for {} (not enforced): {}",
                        self.mode, target, rejection
                    );
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{AUTHORIZATION, HeaderValue};

    const MEMBERS: [&str; 3] = ["a.example.org", "b.example.org", "kk.example.org"];
    const STRANGERS: [&str; 2] = ["evil.example.org", "A.example.org"];

    fn gate(mode: GateMode, enforce: bool) -> FederationGate {
        FederationGate::new(
            mode,
            FederationAllowList::from_domains(MEMBERS),
            enforce,
            Arc::new(AuditLogger::new_null()),
        )
    }

    fn claim(param: &str, domain: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!(
                r#"X-Matrix {}="{}",key="ed25519:1",sig="AAAA""#,
                param, domain
            ))
            .unwrap(),
        );
        headers
    }

    #[test]
    fn test_param_names() {
        assert_eq!(GateMode::Inbound.param_name(), "origin");
        assert_eq!(GateMode::Outbound.param_name(), "destination");
    }

    #[test]
    fn test_members_allowed() {
        let gate = gate(GateMode::Inbound, true);
        for domain in MEMBERS {
            assert!(gate.authorize(&claim("origin", domain), "/").is_ok(), "{}", domain);
        }
    }

    #[test]
    fn test_strangers_denied() {
        let gate = gate(GateMode::Outbound, true);
        for domain in STRANGERS {
            let err = gate
                .authorize(&claim("destination", domain), "/")
                .unwrap_err();
            assert_eq!(err.to_string(), "not part of federation");
            assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(err.cause(), DenyCause::NotFederated);
        }
    }

    #[test]
    fn test_scheme_prefix_stripped() {
        let gate = gate(GateMode::Inbound, true);
        assert!(gate
            .authorize(&claim("origin", " https://a.example.org"), "/")
            .is_ok());
    }

    #[test]
    fn test_missing_credentials() {
        let gate = gate(GateMode::Inbound, true);
        let err = gate.authorize(&HeaderMap::new(), "/").unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing X-Matrix authorization header with origin field"
        );
        assert_eq!(err.errcode(), "M_UNAUTHORIZED");

        // The outbound claim does not satisfy an inbound gate.
        let err = gate
            .authorize(&claim("destination", "a.example.org"), "/")
            .unwrap_err();
        assert_eq!(err, GateRejection::MissingCredentials { param: "origin" });
    }

    #[test]
    fn test_not_enforced_allows_everything_but_still_evaluates() {
        let gate = gate(GateMode::Outbound, false);
        assert!(!gate.is_enforced());
        for domain in STRANGERS {
            let headers = claim("destination", domain);
            assert!(gate.authorize(&headers, "/").is_ok());
            assert!(matches!(
                gate.evaluate(&headers),
                Err(GateRejection::NotFederated { .. })
            ));
        }
        assert!(gate.authorize(&HeaderMap::new(), "/").is_ok());
    }

    #[test]
    fn test_mode_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&GateMode::Inbound).unwrap(), "\"inbound\"");
        assert_eq!(GateMode::Outbound.to_string(), "outbound");
    }
}
