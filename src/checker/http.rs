//! HTTP availability check.

use async_trait::async_trait;
use std::time::{Duration, Instant};

use super::{
    option_str, option_u64, AutoFill, CheckError, CheckMeta, CheckOutcome, Checker, CheckerAvailability,
    CheckerOptionDocumentation, CheckerOptionsDocumentation,
};
use crate::db::{CheckStatus, CheckerOptions};

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_WARNING_LATENCY_MS: u64 = 2000;

/// Fetches a URL and grades the response code and latency.
pub struct HttpChecker;

#[async_trait]
impl Checker for HttpChecker {
    fn name(&self) -> &str {
        "http"
    }

    fn availability(&self) -> CheckerAvailability {
        CheckerAvailability {
            apply_to_domain: true,
            apply_to_service: true,
        }
    }

    fn options(&self) -> CheckerOptionsDocumentation {
        CheckerOptionsDocumentation {
            options: vec![
                CheckerOptionDocumentation::new(
                    "url",
                    "URL",
                    "Address to fetch. Defaults to https:// followed by the domain name.",
                ),
                CheckerOptionDocumentation::new("domain_name", "Domain name", "Domain the target belongs to.")
                    .auto_filled(AutoFill::DomainName),
                CheckerOptionDocumentation::new("timeout_secs", "Timeout", "Seconds before giving up.")
                    .with_default(serde_json::json!(DEFAULT_TIMEOUT_SECS)),
                CheckerOptionDocumentation::new(
                    "warning_latency_ms",
                    "Slow response threshold",
                    "Responses slower than this are reported as warnings.",
                )
                .with_default(serde_json::json!(DEFAULT_WARNING_LATENCY_MS)),
            ],
        }
    }

    async fn run_check(&self, options: CheckerOptions, _meta: CheckMeta) -> Result<CheckOutcome, CheckError> {
        let url = resolve_url(&options)?;
        let timeout = Duration::from_secs(option_u64(&options, "timeout_secs", DEFAULT_TIMEOUT_SECS));
        let warning_latency =
            Duration::from_millis(option_u64(&options, "warning_latency_ms", DEFAULT_WARNING_LATENCY_MS));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CheckError::Network(e.to_string()))?;

        let start = Instant::now();

        let response = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                let line = if e.is_timeout() {
                    format!("{} did not answer within {:?}", url, timeout)
                } else {
                    format!("{} is unreachable", url)
                };
                return Ok(CheckOutcome::new(
                    CheckStatus::Critical,
                    line,
                    serde_json::json!({ "url": url, "error": e.to_string() }),
                ));
            }
        };

        let status_code = response.status();

        // Read the full body to measure complete transfer time
        let body = response
            .bytes()
            .await
            .map_err(|e| CheckError::Network(e.to_string()))?;

        let latency = start.elapsed();
        let status = grade_response(status_code.as_u16(), latency, warning_latency);

        Ok(CheckOutcome::new(
            status,
            format!("{} answered {} in {} ms", url, status_code.as_u16(), latency.as_millis()),
            serde_json::json!({
                "url": url,
                "status_code": status_code.as_u16(),
                "latency_ms": latency.as_millis() as u64,
                "body_bytes": body.len(),
            }),
        ))
    }
}

fn resolve_url(options: &CheckerOptions) -> Result<String, CheckError> {
    if let Some(url) = option_str(options, "url") {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(url.to_string());
        }
        return Ok(format!("http://{}", url));
    }

    option_str(options, "domain_name")
        .map(|domain| format!("https://{}", domain.trim_end_matches('.')))
        .ok_or_else(|| CheckError::Config("neither url nor domain_name is set".to_string()))
}

fn grade_response(code: u16, latency: Duration, warning_latency: Duration) -> CheckStatus {
    match code {
        500..=599 => CheckStatus::Critical,
        400..=499 => CheckStatus::Warning,
        _ if latency > warning_latency => CheckStatus::Warning,
        _ => CheckStatus::Ok,
    }
}
