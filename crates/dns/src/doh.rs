use std::net::Ipv4Addr;

use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const DNS_JSON: &str = "application/dns-json";
const RCODE_NOERROR: u32 = 0;
const RCODE_NXDOMAIN: u32 = 3;

/// Client for JSON DNS-over-HTTPS resolvers (Cloudflare and Google dialect).
#[derive(Clone)]
pub struct DohClient {
    http: Client,
    endpoint: Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Txt,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Txt => "TXT",
        }
    }

    fn code(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Txt => 16,
        }
    }
}

impl DohClient {
    pub fn new(endpoint: Url, http: Client) -> Self {
        Self { http, endpoint }
    }

    /// Returns every TXT string published at `name`, with multi-part
    /// records joined. A missing name yields an empty list.
    pub async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let answers = self.query(name, RecordType::Txt).await?;
        Ok(answers.iter().map(|data| join_txt(data)).collect())
    }

    /// Returns the IPv4 addresses published at `name`.
    pub async fn lookup_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let answers = self.query(name, RecordType::A).await?;
        answers
            .iter()
            .map(|data| {
                data.parse::<Ipv4Addr>()
                    .map_err(|_| DnsError::Malformed(format!("invalid A record data {data:?}")))
            })
            .collect()
    }

    async fn query(&self, name: &str, record_type: RecordType) -> Result<Vec<String>, DnsError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("type", record_type.as_str());

        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, DNS_JSON)
            .send()
            .await?;
        let body: DohResponse = parse_json(response).await?;

        match body.status {
            RCODE_NOERROR => {}
            RCODE_NXDOMAIN => return Ok(Vec::new()),
            rcode => return Err(DnsError::Rcode(rcode)),
        }

        // Answers may include the CNAME chain that led to the records.
        Ok(body
            .answer
            .unwrap_or_default()
            .into_iter()
            .filter(|answer| answer.record_type == record_type.code())
            .map(|answer| answer.data)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// Joins the quoted character-strings of a TXT record into one value.
fn join_txt(data: &str) -> String {
    let trimmed = data.trim();
    if !trimmed.starts_with('"') {
        return trimmed.to_string();
    }

    let mut joined = String::with_capacity(trimmed.len());
    let mut in_quotes = false;
    let mut chars = trimmed.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    joined.push(escaped);
                }
            }
            other if in_quotes => joined.push(other),
            _ => {}
        }
    }
    joined
}

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("resolver answered with rcode {0}")]
    Rcode(u32),
    #[error("malformed answer: {0}")]
    Malformed(String),
}

async fn parse_json<T>(response: Response) -> Result<T, DnsError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(DnsError::Status { status, body });
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> DohClient {
        DohClient::new(
            Url::parse(&server.url("/dns-query")).expect("url"),
            Client::builder().build().expect("client"),
        )
    }

    #[test]
    fn txt_parts_are_joined() {
        assert_eq!(join_txt("\"abc\" \"def\""), "abcdef");
        assert_eq!(join_txt("\"with \\\"quote\\\"\""), "with \"quote\"");
        assert_eq!(join_txt("unquoted"), "unquoted");
    }

    #[tokio::test]
    async fn lookup_txt_filters_record_types() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/dns-query")
                    .query_param("name", "_shopfront-verification.shop.example.com")
                    .query_param("type", "TXT")
                    .header("accept", "application/dns-json");
                then.status(200).json_body(json!({
                    "Status": 0,
                    "Answer": [
                        { "name": "x", "type": 5, "TTL": 300, "data": "alias.example.net." },
                        { "name": "x", "type": 16, "TTL": 300, "data": "\"shopfront-verification=abc\"" }
                    ]
                }));
            })
            .await;

        let records = client(&server)
            .lookup_txt("_shopfront-verification.shop.example.com")
            .await
            .expect("lookup");
        mock.assert_async().await;
        assert_eq!(records, vec!["shopfront-verification=abc".to_string()]);
    }

    #[tokio::test]
    async fn nxdomain_is_an_empty_answer() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/dns-query");
                then.status(200).json_body(json!({ "Status": 3 }));
            })
            .await;

        let addresses = client(&server)
            .lookup_a("missing.example.com")
            .await
            .expect("lookup");
        assert!(addresses.is_empty());
    }

    #[tokio::test]
    async fn servfail_and_http_errors_are_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).query_param("type", "A");
                then.status(200).json_body(json!({ "Status": 2 }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).query_param("type", "TXT");
                then.status(503).body("unavailable");
            })
            .await;

        let client = client(&server);
        assert!(matches!(
            client.lookup_a("shop.example.com").await,
            Err(DnsError::Rcode(2))
        ));
        match client.lookup_txt("shop.example.com").await {
            Err(DnsError::Status { status, body }) => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "unavailable");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
