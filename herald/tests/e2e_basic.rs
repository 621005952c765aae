//! End-to-end tests: operator commands over the control socket driving a
//! live worker pool
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod support;

use std::time::Duration;

use herald_common::audit::AuditOutcome;
use herald_control::{ControlError, NewsletterCommand, RequestCommand, ResponseData};
use herald_delivery::{CampaignStatus, CircuitState};
use herald_queue::{JobFilter, JobStatus, JobStore};
use pretty_assertions::assert_eq;
use support::{E2ETestHarness, harness::VIEWER_TOKEN};
use tempfile::TempDir;

fn newsletter(command: NewsletterCommand) -> RequestCommand {
    RequestCommand::Newsletter(command)
}

fn publish(campaign_id: &str) -> RequestCommand {
    newsletter(NewsletterCommand::Publish {
        campaign_id: campaign_id.to_string(),
    })
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn test_publish_delivers_to_every_subscriber() {
    let harness = E2ETestHarness::builder()
        .subscriber("s1", "ada@example.com")
        .subscriber("s2", "grace@example.com")
        .subscriber("s3", "linus@example.com")
        .campaign("weekly")
        .build()
        .await;

    let accepted = harness.client().execute(publish("weekly")).await.unwrap();
    assert!(matches!(accepted, Some(ResponseData::JobAccepted { .. })));

    assert!(
        harness
            .wait_for_campaign("weekly", CampaignStatus::Sent, Duration::from_secs(5))
            .await
    );

    let mut delivered = harness.transport.delivered();
    delivered.sort();
    assert_eq!(
        delivered,
        vec!["ada@example.com", "grace@example.com", "linus@example.com"]
    );

    let stats = harness
        .client()
        .execute(newsletter(NewsletterCommand::Stats {
            campaign_id: Some("weekly".to_string()),
        }))
        .await
        .unwrap();
    match stats {
        Some(ResponseData::Stats(stats)) => {
            assert_eq!(stats.sent, 3);
            assert_eq!(stats.failed, 0);
            assert_eq!(stats.pending, 0);
            assert_eq!(stats.total, 3);
        }
        other => panic!("Expected stats, got {other:?}"),
    }

    let records = harness.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].actor, "ops");
    assert_eq!(records[0].action, "newsletter.publish");
    assert_eq!(records[0].target.as_deref(), Some("campaign:weekly"));
    assert_eq!(records[0].outcome, AuditOutcome::Success);

    harness.shutdown().await;
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn test_bounced_recipient_is_listed_masked_and_retryable() {
    let harness = E2ETestHarness::builder()
        .subscriber("s1", "ada@example.com")
        .subscriber("s2", "bounce@example.com")
        .campaign("weekly")
        .bouncing("bounce@example.com")
        .build()
        .await;

    harness.client().execute(publish("weekly")).await.unwrap();
    assert!(
        harness
            .wait_for_campaign("weekly", CampaignStatus::Sent, Duration::from_secs(5))
            .await
    );

    let failed = match harness
        .client()
        .execute(newsletter(NewsletterCommand::FailedJobs { limit: 10 }))
        .await
        .unwrap()
    {
        Some(ResponseData::FailedJobs(failed)) => failed,
        other => panic!("Expected failed jobs, got {other:?}"),
    };
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].recipient.as_deref(), Some("bou***@example.com"));
    assert_eq!(failed[0].attempts, 1);

    let job_id = failed[0].job_id.to_string();
    let requeued = harness
        .client()
        .execute(newsletter(NewsletterCommand::RetryFailedJob {
            job_id: job_id.clone(),
        }))
        .await
        .unwrap();
    assert_eq!(requeued, Some(ResponseData::JobAccepted { job_id: job_id.clone() }));

    // Still bouncing, so the job lands back in the DLQ on its next attempt
    let job = failed[0].job_id;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = harness.services.jobs.get(&job).await.unwrap();
        if current.status == JobStatus::Dead && current.attempts == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job was not retried");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let retry_audit = harness
        .audit
        .records()
        .into_iter()
        .find(|r| r.action == "newsletter.retry")
        .expect("retry was audited");
    assert_eq!(retry_audit.target, Some(format!("job:{job_id}")));
    assert_eq!(retry_audit.outcome, AuditOutcome::Success);

    harness.shutdown().await;
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn test_retrying_a_live_job_fails_and_is_audited() {
    let harness = E2ETestHarness::builder()
        .subscriber("s1", "ada@example.com")
        .campaign("weekly")
        .build()
        .await;

    harness.client().execute(publish("weekly")).await.unwrap();
    assert!(
        harness
            .wait_for_campaign("weekly", CampaignStatus::Sent, Duration::from_secs(5))
            .await
    );

    let sent = harness
        .services
        .jobs
        .list(&JobFilter::campaign("weekly"))
        .await
        .unwrap()
        .remove(0);

    let result = harness
        .client()
        .execute(newsletter(NewsletterCommand::RetryFailedJob {
            job_id: sent.id.to_string(),
        }))
        .await;
    assert!(matches!(result, Err(ControlError::ServerError(_))));

    let record = harness
        .audit
        .records()
        .into_iter()
        .find(|r| r.action == "newsletter.retry")
        .expect("retry was audited");
    assert!(matches!(record.outcome, AuditOutcome::Failed(_)));

    harness.shutdown().await;
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn test_read_only_operator_cannot_publish() {
    let harness = E2ETestHarness::builder()
        .subscriber("s1", "ada@example.com")
        .campaign("weekly")
        .build()
        .await;

    let viewer = harness.client_with(VIEWER_TOKEN);
    assert!(
        viewer
            .execute(newsletter(NewsletterCommand::QueueMetrics))
            .await
            .is_ok()
    );

    let result = viewer.execute(publish("weekly")).await;
    assert!(matches!(result, Err(ControlError::ServerError(_))));

    let anonymous = harness.anonymous_client().execute(publish("weekly")).await;
    assert!(anonymous.is_err());

    let records = harness.audit.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].actor, "viewer");
    assert!(matches!(records[0].outcome, AuditOutcome::Denied(_)));
    assert_eq!(records[1].actor, "anonymous");

    let campaign = harness
        .client()
        .execute(newsletter(NewsletterCommand::Campaigns { limit: 10 }))
        .await
        .unwrap();
    match campaign {
        Some(ResponseData::Campaigns(campaigns)) => {
            assert_eq!(campaigns[0].campaign.status, CampaignStatus::Draft);
        }
        other => panic!("Expected campaigns, got {other:?}"),
    }

    harness.shutdown().await;
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn test_reset_circuit_breaker() {
    let harness = E2ETestHarness::builder().build().await;

    let breaker = harness.services.processor.breaker();
    for _ in 0..breaker.config().failure_threshold {
        let admission = breaker.allow_request().expect("breaker is closed");
        breaker.record_failure(admission);
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let data = harness
        .client()
        .execute(newsletter(NewsletterCommand::ResetCircuitBreaker))
        .await
        .unwrap();
    match data {
        Some(ResponseData::Circuit(snapshot)) => {
            assert_eq!(snapshot.state, CircuitState::Closed);
            assert_eq!(snapshot.failure_count, 0);
        }
        other => panic!("Expected circuit snapshot, got {other:?}"),
    }

    let metrics = harness
        .client()
        .execute(newsletter(NewsletterCommand::QueueMetrics))
        .await
        .unwrap();
    match metrics {
        Some(ResponseData::QueueMetrics(snapshot)) => {
            assert_eq!(snapshot.circuit.state, CircuitState::Closed);
            assert_eq!(snapshot.backpressure.max_concurrency, 5);
        }
        other => panic!("Expected queue metrics, got {other:?}"),
    }

    harness.shutdown().await;
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn test_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let snapshot = dir.path().join("queue.bin");

    let harness = E2ETestHarness::builder()
        .snapshot(snapshot.clone())
        .build()
        .await;
    let date = chrono::NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    harness
        .client()
        .execute(newsletter(NewsletterCommand::GenerateDraft { date }))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while harness
        .services
        .jobs
        .counts(&JobFilter::default())
        .await
        .unwrap()
        .sent
        == 0
    {
        assert!(tokio::time::Instant::now() < deadline, "draft job was not processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    harness.shutdown().await;
    assert!(snapshot.exists());

    let restarted = E2ETestHarness::builder()
        .snapshot(snapshot.clone())
        .build()
        .await;
    let drafts = restarted
        .services
        .jobs
        .list(&JobFilter::default())
        .await
        .unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].status, JobStatus::Sent);

    restarted.shutdown().await;
}
