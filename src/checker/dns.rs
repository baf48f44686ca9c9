//! DNS resolution check using raw UDP packets.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::{
    option_str, option_u64, AutoFill, CheckError, CheckMeta, CheckOutcome, Checker, CheckerAvailability,
    CheckerOptionDocumentation, CheckerOptionsDocumentation,
};
use crate::db::{CheckStatus, CheckerOptions};

const DEFAULT_RESOLVER: &str = "1.1.1.1:53";
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Asks a resolver for the A record of the domain.
pub struct DnsChecker;

#[async_trait]
impl Checker for DnsChecker {
    fn name(&self) -> &str {
        "dns"
    }

    fn availability(&self) -> CheckerAvailability {
        CheckerAvailability {
            apply_to_domain: true,
            apply_to_service: false,
        }
    }

    fn options(&self) -> CheckerOptionsDocumentation {
        CheckerOptionsDocumentation {
            options: vec![
                CheckerOptionDocumentation::new("domain_name", "Domain name", "Name to resolve.")
                    .required()
                    .auto_filled(AutoFill::DomainName),
                CheckerOptionDocumentation::new("resolver", "Resolver", "Resolver address, port 53 when omitted.")
                    .with_default(serde_json::json!(DEFAULT_RESOLVER)),
                CheckerOptionDocumentation::new("timeout_secs", "Timeout", "Seconds to wait for an answer.")
                    .with_default(serde_json::json!(DEFAULT_TIMEOUT_SECS)),
            ],
        }
    }

    async fn run_check(&self, options: CheckerOptions, _meta: CheckMeta) -> Result<CheckOutcome, CheckError> {
        let domain = option_str(&options, "domain_name")
            .ok_or_else(|| CheckError::Config("domain_name is not set".to_string()))?;
        let resolver = option_str(&options, "resolver").unwrap_or(DEFAULT_RESOLVER);
        let timeout = Duration::from_secs(option_u64(&options, "timeout_secs", DEFAULT_TIMEOUT_SECS));

        // Ensure address has port
        let resolver_addr = if resolver.contains(':') {
            resolver.to_string()
        } else {
            format!("{}:53", resolver)
        };

        let packet = build_dns_query(domain)?;
        let tx_id = u16::from_be_bytes([packet[0], packet[1]]);

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| CheckError::Network(format!("failed to bind socket: {}", e)))?;
        socket
            .connect(&resolver_addr)
            .await
            .map_err(|e| CheckError::Network(format!("failed to connect: {}", e)))?;

        let start = Instant::now();

        socket
            .send(&packet)
            .await
            .map_err(|e| CheckError::Network(format!("failed to send: {}", e)))?;

        let mut response = [0u8; 512];
        let n = match tokio::time::timeout(timeout, socket.recv(&mut response)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(CheckError::Network(format!("failed to recv: {}", e))),
            Err(_) => {
                return Ok(CheckOutcome::new(
                    CheckStatus::Critical,
                    format!("{} did not answer within {:?}", resolver_addr, timeout),
                    serde_json::json!({ "domain": domain, "resolver": resolver_addr }),
                ));
            }
        };

        let latency = start.elapsed();
        let (status, line) = evaluate_response(&response[..n], tx_id)?;

        Ok(CheckOutcome::new(
            status,
            format!("{}: {}", domain, line),
            serde_json::json!({
                "domain": domain,
                "resolver": resolver_addr,
                "latency_ms": latency.as_millis() as u64,
            }),
        ))
    }
}

/// Grade a resolver answer for the query carrying `tx_id`.
fn evaluate_response(response: &[u8], tx_id: u16) -> Result<(CheckStatus, String), CheckError> {
    if response.len() < 12 {
        return Err(CheckError::Network(format!("response too short: {} bytes", response.len())));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(CheckError::Network(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    // RCODE is the lower 4 bits of byte 3
    let rcode = response[3] & 0x0F;
    let an_count = u16::from_be_bytes([response[6], response[7]]);

    Ok(match (rcode, an_count) {
        (0, 0) => (CheckStatus::Warning, "no A record".to_string()),
        (0, n) => (CheckStatus::Ok, format!("{} answer(s)", n)),
        (3, _) => (CheckStatus::Critical, "domain does not exist".to_string()),
        (code, _) => (CheckStatus::Critical, format!("resolver returned RCODE {}", code)),
    })
}

/// Build a DNS query packet for the A record of `domain`.
fn build_dns_query(domain: &str) -> Result<Vec<u8>, CheckError> {
    let tx_id: u16 = rand::random();
    let flags: u16 = 0x0100; // Standard query, recursion desired

    // Header (12 bytes)
    let mut packet = Vec::with_capacity(64);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]); // ANCOUNT, NSCOUNT, ARCOUNT

    // Question name: length-prefixed labels
    for label in domain.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(CheckError::Config(format!("invalid domain name: {}", domain)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    // QTYPE A, QCLASS IN
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());

    Ok(packet)
}
