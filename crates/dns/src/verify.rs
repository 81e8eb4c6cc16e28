use std::net::Ipv4Addr;

use crate::doh::{DnsError, DohClient};

const VERIFICATION_LABEL: &str = "_shopfront-verification";
const VERIFICATION_PREFIX: &str = "shopfront-verification=";

/// Name of the TXT record that proves ownership of `hostname`.
pub fn verification_host(hostname: &str) -> String {
    format!("{VERIFICATION_LABEL}.{hostname}")
}

/// Expected TXT value for a verification token.
pub fn verification_value(token: &str) -> String {
    format!("{VERIFICATION_PREFIX}{token}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    Failed(String),
}

/// Ownership and routing checks for custom domains.
#[derive(Clone)]
pub struct DomainCheck {
    client: DohClient,
    edge_ips: Vec<Ipv4Addr>,
}

impl DomainCheck {
    pub fn new(client: DohClient, edge_ips: Vec<Ipv4Addr>) -> Self {
        Self { client, edge_ips }
    }

    pub fn edge_ips(&self) -> &[Ipv4Addr] {
        &self.edge_ips
    }

    /// Runs the TXT check and, when edge IPs are configured, the A record check.
    ///
    /// Error rcodes such as SERVFAIL describe the customer's zone and become a
    /// failed outcome. Transport failures are returned as errors so callers can
    /// leave the stored status untouched.
    pub async fn check(
        &self,
        hostname: &str,
        token: &str,
    ) -> Result<VerificationOutcome, DnsError> {
        let expected = verification_value(token);
        let txt_host = verification_host(hostname);
        let txt = match zone_answer(self.client.lookup_txt(&txt_host).await, &txt_host)? {
            Ok(txt) => txt,
            Err(reason) => return Ok(VerificationOutcome::Failed(reason)),
        };
        if !txt.iter().any(|value| value.trim() == expected) {
            return Ok(VerificationOutcome::Failed(format!(
                "TXT record {txt_host} does not contain {expected}"
            )));
        }

        if self.edge_ips.is_empty() {
            return Ok(VerificationOutcome::Verified);
        }

        let addresses = match zone_answer(self.client.lookup_a(hostname).await, hostname)? {
            Ok(addresses) => addresses,
            Err(reason) => return Ok(VerificationOutcome::Failed(reason)),
        };
        if addresses.iter().any(|addr| self.edge_ips.contains(addr)) {
            Ok(VerificationOutcome::Verified)
        } else if addresses.is_empty() {
            Ok(VerificationOutcome::Failed(format!(
                "no A record found for {hostname}"
            )))
        } else {
            let found: Vec<String> = addresses.iter().map(Ipv4Addr::to_string).collect();
            Ok(VerificationOutcome::Failed(format!(
                "A records for {hostname} ({}) do not point at the edge",
                found.join(", ")
            )))
        }
    }
}

fn rcode_name(rcode: u32) -> &'static str {
    match rcode {
        1 => "FORMERR",
        2 => "SERVFAIL",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "an error",
    }
}

/// Turns an error rcode into a failure reason, passing other errors through.
fn zone_answer<T>(
    result: Result<T, DnsError>,
    name: &str,
) -> Result<Result<T, String>, DnsError> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(DnsError::Rcode(rcode)) => Ok(Err(format!(
            "resolver answered {} (rcode {rcode}) for {name}",
            rcode_name(rcode)
        ))),
        Err(err) => Err(err),
    }
}
