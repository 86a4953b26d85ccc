//! The federation allow-list: partner directory fetched from the
//! registration service and kept fresh by the periodic cache engine.

use std::collections::HashSet;
use std::sync::Arc;

use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::FederationError;
use crate::cache::{
    CacheError, CacheHandle, CacheStore, FetchOutcome, PeriodicResourceCache, RefreshSchedule,
    ResourceSource,
};
use crate::config::FederationListConfig;
use crate::telemetry::{AuditEvent, AuditLogger};

/// One partner entry of the federation directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationDomain {
    /// Server name of the partner homeserver.
    pub domain: String,
    /// Whether the partner is operated by an insurance.
    #[serde(rename = "isInsurance", default)]
    pub is_insurance: bool,
    /// Telematik ID of the operating organization.
    #[serde(rename = "telematikID", default)]
    pub telematik_id: String,
    /// Institution identifiers (IK numbers) served by this domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ik: Option<Vec<String>>,
}

/// Parsed federation directory: the published value of the allow-list cache.
#[derive(Debug, Clone, Default)]
pub struct FederationDirectory {
    version: String,
    domains: Vec<FederationDomain>,
    index: HashSet<String>,
}

impl FederationDirectory {
    /// Build a directory from its entries.
    pub fn new(version: impl Into<String>, domains: Vec<FederationDomain>) -> Self {
        let index = domains.iter().map(|d| d.domain.clone()).collect();
        Self {
            version: version.into(),
            domains,
            index,
        }
    }

    /// Parse the registration service's response body.
    ///
    /// Accepts `{"version": 7, "domainList": [...]}` and a bare `[...]`
    /// (empty version token).
    pub fn parse(content: &str) -> Result<Self, CacheError> {
        let wire: WireList =
            serde_json::from_str(content).map_err(|e| CacheError::Parse(e.to_string()))?;
        Ok(match wire {
            WireList::Versioned {
                version,
                domain_list,
            } => Self::new(version.into_token(), domain_list),
            WireList::Bare(domains) => Self::new(String::new(), domains),
        })
    }

    /// Whether `domain` is listed. Exact, case-sensitive match.
    pub fn contains(&self, domain: &str) -> bool {
        self.index.contains(domain)
    }

    /// All entries, in directory order.
    pub fn domains(&self) -> &[FederationDomain] {
        &self.domains
    }

    /// Version token of this directory.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// First entry serving institution identifier `ik`.
    pub fn find_by_ik(&self, ik: &str) -> Option<&FederationDomain> {
        self.domains
            .iter()
            .find(|d| d.ik.as_ref().is_some_and(|iks| iks.iter().any(|i| i == ik)))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Whether the directory has no entries.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireList {
    Versioned {
        version: WireVersion,
        #[serde(rename = "domainList")]
        domain_list: Vec<FederationDomain>,
    },
    Bare(Vec<FederationDomain>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireVersion {
    Number(i64),
    Text(String),
}

impl WireVersion {
    fn into_token(self) -> String {
        match self {
            WireVersion::Number(n) => n.to_string(),
            WireVersion::Text(s) => s,
        }
    }
}

/// Fetches the federation directory from the registration service.
pub struct FederationListSource {
    client: reqwest::Client,
    url: Url,
    conditional: bool,
    audit: Arc<AuditLogger>,
}

impl FederationListSource {
    /// Build a source with the configured URL and timeouts.
    pub fn new(
        config: &FederationListConfig,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, FederationError> {
        let url = Url::parse(&config.url).map_err(|e| FederationError::InvalidUrl {
            url: config.url.clone(),
            message: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url,
            conditional: config.conditional_fetch,
            audit,
        })
    }
}

impl ResourceSource for FederationListSource {
    type Value = FederationDirectory;

    async fn fetch(&self, version: Option<&str>) -> FetchOutcome {
        let mut request = self.client.get(self.url.clone());
        if let Some(version) = version.filter(|_| self.conditional) {
            request = request.query(&[("version", version)]);
        }
        debug!("Requesting federation list from {}", self.url);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return FetchOutcome::Error(format!(
                    "federation list request to {} failed: {}",
                    self.url, e
                ));
            }
        };

        match response.status() {
            StatusCode::OK => match response.text().await {
                Ok(body) => FetchOutcome::NewValue(body),
                Err(e) => FetchOutcome::Error(format!("failed to read federation list: {}", e)),
            },
            StatusCode::NO_CONTENT => FetchOutcome::NotModified,
            status => {
                let body = response.text().await.unwrap_or_default();
                FetchOutcome::Error(format!(
                    "unexpected federation list response: status={} body={}",
                    status, body
                ))
            }
        }
    }

    fn parse(&self, content: &str) -> Result<FederationDirectory, CacheError> {
        FederationDirectory::parse(content)
    }

    fn version_of(&self, value: &FederationDirectory) -> String {
        value.version().to_string()
    }

    fn on_updated(&self, value: &FederationDirectory) {
        self.audit.log(AuditEvent::AllowListUpdated {
            version: value.version().to_string(),
            domains: value.len(),
        });
    }

    fn on_failed(&self, message: &str) {
        self.audit.log(AuditEvent::AllowListUpdateFailed {
            message: message.to_string(),
        });
    }
}

/// Live view of the trusted partner domains.
///
/// Cheap to clone; every clone reads the latest published directory. Until
/// the first directory is loaded or fetched, no domain is trusted.
#[derive(Debug, Clone)]
pub struct FederationAllowList {
    handle: CacheHandle<FederationDirectory>,
}

impl FederationAllowList {
    /// Open the on-disk cache and build the refresh engine.
    ///
    /// The returned engine must be spawned (`tokio::spawn(engine.run())`)
    /// to keep the list fresh. The stored list is visible immediately.
    pub fn open(
        config: &FederationListConfig,
        audit: Arc<AuditLogger>,
    ) -> Result<(Self, PeriodicResourceCache<FederationListSource>), FederationError> {
        let source = FederationListSource::new(config, audit)?;
        let store = CacheStore::new(config.file_path(), config.meta_path());
        let schedule = RefreshSchedule {
            refresh_interval: config.refresh_interval(),
            error_backoff: config.error_backoff(),
            failure_cooldown: config.failure_cooldown(),
        };
        let (engine, handle) = PeriodicResourceCache::open(store, source, schedule)?;
        Ok((Self { handle }, engine))
    }

    /// Wrap an existing cache handle.
    pub fn from_handle(handle: CacheHandle<FederationDirectory>) -> Self {
        Self { handle }
    }

    /// A fixed list of domains, never refreshed.
    pub fn from_domains<I, D>(domains: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        let entries = domains
            .into_iter()
            .map(|domain| FederationDomain {
                domain: domain.into(),
                is_insurance: false,
                telematik_id: String::new(),
                ik: None,
            })
            .collect();
        Self::from_handle(CacheHandle::fixed(FederationDirectory::new("", entries)))
    }

    /// The current directory, if one has been loaded.
    pub fn directory(&self) -> Option<Arc<FederationDirectory>> {
        self.handle.current()
    }

    /// Whether `domain` is a trusted partner.
    pub fn contains(&self, domain: &str) -> bool {
        self.directory().is_some_and(|d| d.contains(domain))
    }

    /// All current entries.
    pub fn domains(&self) -> Vec<FederationDomain> {
        self.directory()
            .map(|d| d.domains().to_vec())
            .unwrap_or_default()
    }

    /// Version token of the current directory.
    pub fn version(&self) -> Option<String> {
        self.directory().map(|d| d.version().to_string())
    }

    /// First entry serving institution identifier `ik`.
    pub fn find_by_ik(&self, ik: &str) -> Option<FederationDomain> {
        self.directory().and_then(|d| d.find_by_ik(ik).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = r#"{
        "version": 7,
        "domainList": [
            {"domain": "a.example.org", "isInsurance": false, "telematikID": "1-1"},
            {"domain": "kk.example.org", "isInsurance": true, "telematikID": "8-2", "ik": ["101575519", "109500969"]}
        ]
    }"#;

    #[test]
    fn test_parse_versioned_list() {
        let dir = FederationDirectory::parse(LIST).unwrap();
        assert_eq!(dir.version(), "7");
        assert_eq!(dir.len(), 2);
        assert!(dir.contains("a.example.org"));
        assert!(!dir.contains("A.example.org"));
        assert!(dir.domains()[1].is_insurance);
        assert_eq!(dir.domains()[1].telematik_id, "8-2");
    }

    #[test]
    fn test_parse_bare_array() {
        let dir = FederationDirectory::parse(r#"[{"domain": "a.example.org"}]"#).unwrap();
        assert_eq!(dir.version(), "");
        assert!(dir.contains("a.example.org"));
    }

    #[test]
    fn test_parse_string_version() {
        let dir =
            FederationDirectory::parse(r#"{"version": "2026-01", "domainList": []}"#).unwrap();
        assert_eq!(dir.version(), "2026-01");
        assert!(dir.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            FederationDirectory::parse("<html>"),
            Err(CacheError::Parse(_))
        ));
        assert!(FederationDirectory::parse(r#"{"version": 1}"#).is_err());
    }

    #[test]
    fn test_find_by_ik() {
        let dir = FederationDirectory::parse(LIST).unwrap();
        assert_eq!(
            dir.find_by_ik("109500969").map(|d| d.domain.as_str()),
            Some("kk.example.org")
        );
        assert!(dir.find_by_ik("000000000").is_none());
    }

    #[test]
    fn test_allow_list_from_domains() {
        let list = FederationAllowList::from_domains(["a.example.org", "b.example.org"]);
        assert!(list.contains("a.example.org"));
        assert!(!list.contains("c.example.org"));
        assert_eq!(list.domains().len(), 2);
        assert_eq!(list.version().as_deref(), Some(""));
    }

    #[test]
    fn test_source_rejects_bad_url() {
        let config = FederationListConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        let result = FederationListSource::new(&config, Arc::new(AuditLogger::new_null()));
        assert!(matches!(result, Err(FederationError::InvalidUrl { .. })));
    }
}
