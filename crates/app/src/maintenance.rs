use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use shopfront_core::types::DomainStatus;
use shopfront_dns::{DomainCheck, VerificationOutcome};
use shopfront_storage::{Database, DomainError, DomainVerificationUpdate};

const BATCH_LIMIT: i64 = 1000;
const DOMAIN_BATCH_LIMIT: i64 = 25;
const REVOKED_TOKEN_RETENTION_DAYS: i64 = 7;
const DEFAULT_CART_TTL_DAYS: i64 = 30;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Background worker for TTL sweeps, pending domain checks and WAL checkpoints.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    domain_check: DomainCheck,
    cart_ttl: ChronoDuration,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    interval: Duration,
}

/// Counts of one pending-domain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DomainSweep {
    pub verified: u64,
    pub pending: u64,
    pub errors: u64,
}

impl MaintenanceWorker {
    pub fn new(database: Database, domain_check: DomainCheck, cart_ttl: Duration) -> Self {
        Self {
            database,
            domain_check,
            cart_ttl: ChronoDuration::from_std(cart_ttl)
                .unwrap_or_else(|_| ChronoDuration::days(DEFAULT_CART_TTL_DAYS)),
            clock: Arc::new(Utc::now),
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Overrides the clock used for determining TTL thresholds.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "maintenance", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle.
    pub async fn run_once(&self) -> Result<(), MaintenanceError> {
        let now = (self.clock)();

        let revoked_before = now - ChronoDuration::days(REVOKED_TOKEN_RETENTION_DAYS);
        let (tokens_deleted, tokens_busy) = self
            .delete_expired_rows("refresh_tokens", || async move {
                self.database
                    .refresh_tokens()
                    .delete_expired_batch(now, revoked_before, BATCH_LIMIT)
                    .await
            })
            .await?;
        info!(
            stage = "maintenance",
            table = "refresh_tokens",
            deleted = tokens_deleted,
            busy = tokens_busy,
            revoked_before = %revoked_before.to_rfc3339(),
            "refresh token sweep completed"
        );

        let abandoned_before = now - self.cart_ttl;
        let (carts_deleted, carts_busy) = self
            .delete_expired_rows("carts", || async move {
                self.database
                    .carts()
                    .delete_abandoned_batch(abandoned_before, BATCH_LIMIT)
                    .await
            })
            .await?;
        info!(
            stage = "maintenance",
            table = "carts",
            deleted = carts_deleted,
            busy = carts_busy,
            threshold = %abandoned_before.to_rfc3339(),
            "abandoned cart sweep completed"
        );

        let sweep = self.recheck_pending_domains(now).await?;
        if sweep != DomainSweep::default() {
            info!(
                stage = "maintenance",
                verified = sweep.verified,
                pending = sweep.pending,
                errors = sweep.errors,
                "pending domains rechecked"
            );
        }

        self.run_checkpoint().await?;

        Ok(())
    }

    async fn delete_expired_rows<Fut>(
        &self,
        table: &'static str,
        mut delete_fn: impl FnMut() -> Fut,
    ) -> Result<(u64, bool), MaintenanceError>
    where
        Fut: std::future::Future<Output = Result<u64, SqlxError>>,
    {
        let mut total_deleted = 0u64;
        let mut busy = false;

        loop {
            match delete_fn().await {
                Ok(0) => break,
                Ok(batch_deleted) => {
                    total_deleted += batch_deleted;
                    counter!("db_ttl_deleted_total", "table" => table).increment(batch_deleted);
                }
                Err(err) => {
                    if is_sqlite_busy(&err) {
                        busy = true;
                        counter!("db_busy_total", "op" => "ttl").increment(1);
                        warn!(stage = "maintenance", %table, error = %err, "ttl delete hit busy timeout");
                        break;
                    }

                    return Err(MaintenanceError::TtlDelete { table, source: err });
                }
            }
        }

        Ok((total_deleted, busy))
    }

    /// Checks a batch of PENDING domains. Successes become VERIFIED; failures
    /// stay PENDING with the latest reason so the owner can fix their records.
    pub async fn recheck_pending_domains(
        &self,
        now: DateTime<Utc>,
    ) -> Result<DomainSweep, MaintenanceError> {
        let repo = self.database.domains();
        let pending = repo
            .list_pending_batch(DOMAIN_BATCH_LIMIT)
            .await
            .map_err(|source| MaintenanceError::Domains { source })?;

        let mut sweep = DomainSweep::default();
        for domain in pending {
            let outcome = match self
                .domain_check
                .check(&domain.hostname, &domain.verification_token)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    sweep.errors += 1;
                    counter!("domain_verifications_total", "trigger" => "maintenance", "result" => "error")
                        .increment(1);
                    warn!(stage = "maintenance", domain_id = %domain.id, hostname = %domain.hostname, error = %err, "dns lookup failed");
                    // Stamp the check so the batch moves on to other domains.
                    let reason = format!("DNS lookup failed: {err}");
                    repo.record_verification(
                        &domain.id,
                        &DomainVerificationUpdate {
                            status: DomainStatus::Pending,
                            failure_reason: Some(&reason),
                            checked_at: now,
                        },
                    )
                    .await
                    .map_err(|source| MaintenanceError::Domains { source })?;
                    continue;
                }
            };

            let (status, reason) = match &outcome {
                VerificationOutcome::Verified => (DomainStatus::Verified, None),
                VerificationOutcome::Failed(reason) => (DomainStatus::Pending, Some(reason.as_str())),
            };
            repo.record_verification(
                &domain.id,
                &DomainVerificationUpdate {
                    status,
                    failure_reason: reason,
                    checked_at: now,
                },
            )
            .await
            .map_err(|source| MaintenanceError::Domains { source })?;

            if status == DomainStatus::Verified {
                sweep.verified += 1;
                info!(stage = "maintenance", domain_id = %domain.id, hostname = %domain.hostname, "domain verified");
            } else {
                sweep.pending += 1;
            }
            counter!(
                "domain_verifications_total",
                "trigger" => "maintenance",
                "result" => status.as_str().to_ascii_lowercase()
            )
            .increment(1);
        }

        Ok(sweep)
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();

        match self.database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                if stats.busy_frames > 0 {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "maintenance",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    info!(
                        stage = "maintenance",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
            }
            Err(err) => {
                if is_sqlite_busy(&err) {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(stage = "maintenance", error = %err, "WAL checkpoint hit busy timeout");
                    return Ok(());
                }

                return Err(MaintenanceError::Checkpoint { source: err });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to delete expired rows from {table}")]
    TtlDelete {
        table: &'static str,
        #[source]
        source: SqlxError,
    },
    #[error("failed to recheck pending domains")]
    Domains {
        #[source]
        source: DomainError,
    },
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use axum::http::{Method, StatusCode};
    use httpmock::prelude::*;
    use serde_json::json;
    use shopfront_dns::DohClient;
    use shopfront_storage::NewDomain;
    use url::Url;

    use crate::router::app_router;
    use crate::test_support::{
        create_product, create_store, owner_with_workspace, send, test_state,
        test_state_with_doh,
    };

    fn unreachable_check() -> DomainCheck {
        DomainCheck::new(
            DohClient::new(
                Url::parse("http://127.0.0.1:9/dns-query").expect("url"),
                reqwest::Client::new(),
            ),
            Vec::<Ipv4Addr>::new(),
        )
    }

    async fn count(database: &Database, table: &str) -> i64 {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(database.pool())
            .await
            .expect("count");
        count
    }

    #[tokio::test]
    async fn run_once_sweeps_expired_tokens_and_abandoned_carts() {
        let state = test_state().await;
        let database = state.storage().clone();
        let app = app_router(state);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        create_store(&app, &owner.access_token, &workspace_id, "acme").await;
        let product = create_product(&app, &owner.access_token, &workspace_id, "TEE-M", 2000, 5).await;
        let (status, _) = send(
            &app,
            Method::POST,
            "/storefront/acme/cart/items",
            None,
            Some(json!({ "variant_id": product["variants"][0]["id"], "quantity": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(count(&database, "refresh_tokens").await, 1);
        assert_eq!(count(&database, "carts").await, 1);

        let soon = Utc::now() + ChronoDuration::days(1);
        MaintenanceWorker::new(database.clone(), unreachable_check(), Duration::from_secs(30 * 86_400))
            .with_clock(Arc::new(move || soon))
            .run_once()
            .await
            .expect("run_once");
        assert_eq!(count(&database, "refresh_tokens").await, 1);
        assert_eq!(count(&database, "carts").await, 1);

        let later = Utc::now() + ChronoDuration::days(31);
        MaintenanceWorker::new(database.clone(), unreachable_check(), Duration::from_secs(30 * 86_400))
            .with_clock(Arc::new(move || later))
            .run_once()
            .await
            .expect("run_once");
        assert_eq!(count(&database, "refresh_tokens").await, 0);
        assert_eq!(count(&database, "carts").await, 0);
    }

    #[tokio::test]
    async fn pending_domains_are_promoted_or_keep_their_reason() {
        let server = MockServer::start_async().await;
        let state = test_state_with_doh(&server.url("/dns-query"), Vec::new()).await;
        let database = state.storage().clone();
        let app = app_router(state);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        let store = create_store(&app, &owner.access_token, &workspace_id, "acme").await;
        let domains_uri = format!(
            "/api/workspaces/{workspace_id}/stores/{}/domains",
            store["id"].as_str().expect("id")
        );

        let mut tokens = Vec::new();
        for hostname in ["good.example.com", "bad.example.com"] {
            let (_, domain) = send(
                &app,
                Method::POST,
                &domains_uri,
                Some(&owner.access_token),
                Some(json!({ "hostname": hostname })),
            )
            .await;
            tokens.push(domain["verification_token"].as_str().expect("token").to_string());
        }
        let good_value = format!("\"shopfront-verification={}\"", tokens[0]);
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .query_param("name", "_shopfront-verification.good.example.com")
                    .query_param("type", "TXT");
                then.status(200).json_body(json!({
                    "Status": 0,
                    "Answer": [{ "name": "x", "type": 16, "TTL": 60, "data": good_value }]
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .query_param("name", "_shopfront-verification.bad.example.com")
                    .query_param("type", "TXT");
                then.status(200).json_body(json!({ "Status": 3 }));
            })
            .await;

        let check = DomainCheck::new(
            DohClient::new(
                Url::parse(&server.url("/dns-query")).expect("url"),
                reqwest::Client::new(),
            ),
            Vec::new(),
        );
        let worker = MaintenanceWorker::new(database.clone(), check, Duration::from_secs(86_400));
        let sweep = worker
            .recheck_pending_domains(Utc::now())
            .await
            .expect("sweep");
        assert_eq!(
            sweep,
            DomainSweep {
                verified: 1,
                pending: 1,
                errors: 0
            }
        );

        let (_, listed) = send(&app, Method::GET, &domains_uri, Some(&owner.access_token), None).await;
        let listed = listed.as_array().expect("domains");
        let good = listed
            .iter()
            .find(|domain| domain["hostname"] == "good.example.com")
            .expect("good domain");
        assert_eq!(good["status"], "VERIFIED");
        let bad = listed
            .iter()
            .find(|domain| domain["hostname"] == "bad.example.com")
            .expect("bad domain");
        assert_eq!(bad["status"], "PENDING");
        assert!(bad["failure_reason"].is_string());

        let again = worker
            .recheck_pending_domains(Utc::now())
            .await
            .expect("second sweep");
        assert_eq!(again.verified, 0);
        assert_eq!(again.pending, 1);
    }

    #[tokio::test]
    async fn failing_lookups_do_not_starve_the_pending_batch() {
        let server = MockServer::start_async().await;
        let state = test_state_with_doh(&server.url("/dns-query"), Vec::new()).await;
        let database = state.storage().clone();
        let app = app_router(state);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        let store = create_store(&app, &owner.access_token, &workspace_id, "acme").await;
        let store_id = store["id"].as_str().expect("id");

        let created_at = Utc::now() - ChronoDuration::days(1);
        for index in 0..DOMAIN_BATCH_LIMIT {
            let hostname = format!("lame{index}.example.com");
            database
                .domains()
                .create(&NewDomain {
                    store_id,
                    hostname: &hostname,
                    verification_token: "tok",
                    created_at: created_at + ChronoDuration::seconds(index),
                })
                .await
                .expect("lame domain");
            let txt_host = format!("_shopfront-verification.{hostname}");
            server
                .mock_async(|when, then| {
                    when.method(GET).query_param("name", &txt_host);
                    then.status(503);
                })
                .await;
        }
        database
            .domains()
            .create(&NewDomain {
                store_id,
                hostname: "good.example.com",
                verification_token: "good",
                created_at: Utc::now(),
            })
            .await
            .expect("good domain");
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .query_param("name", "_shopfront-verification.good.example.com")
                    .query_param("type", "TXT");
                then.status(200).json_body(json!({
                    "Status": 0,
                    "Answer": [{ "name": "x", "type": 16, "TTL": 60, "data": "\"shopfront-verification=good\"" }]
                }));
            })
            .await;

        let check = DomainCheck::new(
            DohClient::new(
                Url::parse(&server.url("/dns-query")).expect("url"),
                reqwest::Client::new(),
            ),
            Vec::new(),
        );
        let worker = MaintenanceWorker::new(database.clone(), check, Duration::from_secs(86_400));

        let first = worker
            .recheck_pending_domains(Utc::now())
            .await
            .expect("first sweep");
        assert_eq!(first.errors, DOMAIN_BATCH_LIMIT as u64);
        assert_eq!(first.verified, 0);

        let second = worker
            .recheck_pending_domains(Utc::now() + ChronoDuration::seconds(60))
            .await
            .expect("second sweep");
        assert_eq!(second.verified, 1);

        let (_, listed) = send(
            &app,
            Method::GET,
            &format!("/api/workspaces/{workspace_id}/stores/{store_id}/domains"),
            Some(&owner.access_token),
            None,
        )
        .await;
        let lame = listed
            .as_array()
            .expect("domains")
            .iter()
            .find(|domain| domain["hostname"] == "lame0.example.com")
            .expect("lame domain")
            .clone();
        assert_eq!(lame["status"], "PENDING");
        assert!(lame["last_checked_at"].is_string());
        assert!(lame["failure_reason"]
            .as_str()
            .expect("reason")
            .starts_with("DNS lookup failed"));
    }

    #[tokio::test]
    async fn resolver_outages_are_counted_not_fatal() {
        let state = test_state().await;
        let database = state.storage().clone();
        let app = app_router(state);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        let store = create_store(&app, &owner.access_token, &workspace_id, "acme").await;
        send(
            &app,
            Method::POST,
            &format!(
                "/api/workspaces/{workspace_id}/stores/{}/domains",
                store["id"].as_str().expect("id")
            ),
            Some(&owner.access_token),
            Some(json!({ "hostname": "shop.example.com" })),
        )
        .await;

        let sweep = MaintenanceWorker::new(database, unreachable_check(), Duration::from_secs(86_400))
            .recheck_pending_domains(Utc::now())
            .await
            .expect("sweep");
        assert_eq!(sweep.errors, 1);
        assert_eq!(sweep.verified, 0);
    }
}
