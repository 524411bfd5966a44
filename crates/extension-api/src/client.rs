//! HTTP implementation of [`DomainServiceClient`].

use std::time::Duration;

use async_trait::async_trait;
use pipeline::ports::{DomainServiceClient, DomainServiceError, ValidationReport, ValidationRequest};
use pipeline::DomainServiceName;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use crate::config::{ExtensionConfig, ServiceEndpoint};
use crate::ExtensionError;

pub struct HttpDomainServiceClient {
    client: Client,
    config: ExtensionConfig,
}

impl HttpDomainServiceClient {
    pub fn new(config: ExtensionConfig) -> Result<Self, ExtensionError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ExtensionError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, service: &DomainServiceName) -> Result<&ServiceEndpoint, DomainServiceError> {
        self.config
            .services
            .get(service.as_str())
            .ok_or_else(|| DomainServiceError {
                service: service.clone(),
                message: "service is not registered".into(),
                recoverable: false,
            })
    }
}

#[async_trait]
impl DomainServiceClient for HttpDomainServiceClient {
    #[instrument(skip_all, fields(service = %request.service, node = %request.node))]
    async fn validate(&self, request: ValidationRequest) -> Result<ValidationReport, DomainServiceError> {
        let service = request.service.clone();
        let endpoint = self.endpoint(&service)?;
        let url = format!("{}/v1/validate", endpoint.url.trim_end_matches('/'));
        let fail = |message: String, recoverable: bool| DomainServiceError {
            service: service.clone(),
            message,
            recoverable,
        };

        let mut call = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .json(&request);
        if let Some(token) = &endpoint.token {
            call = call.bearer_auth(token);
        }

        let response = call.send().await.map_err(|e| {
            let recoverable = e.is_timeout() || e.is_connect() || e.is_request();
            warn!(error = %e, recoverable, "domain service call failed");
            fail(e.to_string(), recoverable)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(fail(
                format!("HTTP {}: {}", status.as_u16(), body.trim()),
                is_recoverable_status(status),
            ));
        }

        let report: ValidationReport = response
            .json()
            .await
            .map_err(|e| fail(format!("report could not be decoded: {e}"), e.is_timeout()))?;
        debug!(
            findings = report.findings.len(),
            blocking = report.has_blocking(),
            "domain service report received"
        );
        Ok(report)
    }
}

/// Statuses worth retrying against the same service.
pub fn is_recoverable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500..=599)
}
