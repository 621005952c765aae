//! End-to-end test harness for herald
//!
//! Starts the worker pool and the control socket from a [`Herald`] config,
//! with a scripted transport in place of a real mail provider.
//!
//! # Example
//!
//! ```no_run
//! use support::harness::E2ETestHarness;
//! use std::time::Duration;
//!
//! #[tokio::test]
//! async fn test_publish() {
//!     let harness = E2ETestHarness::builder()
//!         .subscriber("s1", "reader@example.com")
//!         .campaign("weekly")
//!         .build()
//!         .await;
//!
//!     harness.client().execute(/* Publish { .. } */).await.unwrap();
//!     harness.wait_for_campaign("weekly", CampaignStatus::Sent, Duration::from_secs(5)).await;
//!
//!     harness.shutdown().await;
//! }
//! ```

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use herald::controller::{Herald, SeedCampaign, SeedSubscriber, Services};
use herald_common::{Signal, audit::MemoryAuditSink};
use herald_control::{ControlClient, ControlServer, Permission, TokenGrant, hash_token};
use herald_delivery::{
    Audience, CampaignStatus, CampaignStore, DeliveryError, MailTransport, OutboundMessage,
    SubscriberStatus, TransportError,
};
use herald_queue::RetryPolicy;
use tempfile::TempDir;
use tokio::{sync::broadcast, task::JoinHandle, time::timeout};

/// Token with every permission
pub const OPS_TOKEN: &str = "ops-token";

/// Token that can only read
pub const VIEWER_TOKEN: &str = "viewer-token";

/// Accepts everything except a fixed set of hard-bouncing addresses
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    bounce: HashSet<String>,
    delivered: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn delivered(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        if self.bounce.contains(&message.to) {
            return Err(TransportError::HardBounce(format!("550 no such user {}", message.to)));
        }

        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to.clone());
        Ok(())
    }
}

/// Builder for configuring an E2E test harness
pub struct E2ETestHarnessBuilder {
    herald: Herald,
    bounce: HashSet<String>,
    snapshot: Option<PathBuf>,
}

impl E2ETestHarnessBuilder {
    fn new() -> Self {
        let mut herald = Herald::default();
        herald.delivery.workers = 2;
        herald.delivery.poll_interval_ms = 10;
        herald.delivery.backpressure_defer_secs = 0;
        herald.delivery.pause_defer_secs = 0;
        herald.delivery.retry = RetryPolicy {
            max_attempts: 3,
            base_retry_delay_secs: 0,
            max_retry_delay_secs: 0,
            retry_jitter_factor: 0.0,
        };
        herald.control.auth.enabled = true;
        herald.control.auth.tokens = vec![
            TokenGrant {
                actor: "ops".to_string(),
                token_hash: hash_token(OPS_TOKEN),
                permissions: Permission::ALL.to_vec(),
            },
            TokenGrant {
                actor: "viewer".to_string(),
                token_hash: hash_token(VIEWER_TOKEN),
                permissions: vec![Permission::Read],
            },
        ];

        Self {
            herald,
            bounce: HashSet::new(),
            snapshot: None,
        }
    }

    #[must_use]
    pub fn subscriber(mut self, id: &str, email: &str) -> Self {
        self.herald.seed.subscribers.push(SeedSubscriber {
            id: id.to_string(),
            email: email.to_string(),
            status: SubscriberStatus::Verified,
        });
        self
    }

    #[must_use]
    pub fn campaign(mut self, id: &str) -> Self {
        self.herald.seed.campaigns.push(SeedCampaign {
            id: id.to_string(),
            subject: format!("{id} digest"),
            body: "Hello reader".to_string(),
            audience: Audience::All,
        });
        self
    }

    /// Hard-bounce every message to `email`
    #[must_use]
    pub fn bouncing(mut self, email: &str) -> Self {
        self.bounce.insert(email.to_string());
        self
    }

    /// Restore the queue from, and save it to, this file
    #[must_use]
    pub fn snapshot(mut self, path: PathBuf) -> Self {
        self.snapshot = Some(path);
        self
    }

    /// Start the worker pool and control socket
    ///
    /// # Panics
    ///
    /// Panics if the pipeline cannot be built or the socket does not come up.
    pub async fn build(mut self) -> E2ETestHarness {
        let socket_dir = TempDir::new().expect("socket dir");
        let socket_path = socket_dir
            .path()
            .join("herald.sock")
            .to_str()
            .expect("utf-8 socket path")
            .to_string();

        self.herald.control.socket_path.clone_from(&socket_path);
        self.herald.snapshot_path = self.snapshot;

        let transport = Arc::new(ScriptedTransport {
            bounce: self.bounce,
            delivered: Mutex::new(Vec::new()),
        });
        let services = self
            .herald
            .services(transport.clone())
            .await
            .expect("services should build");

        let audit = Arc::new(MemoryAuditSink::new());
        let handler = Arc::new(self.herald.control_handler(&services, audit.clone()));
        let server = ControlServer::new(socket_path.clone(), handler).expect("control server");

        let (shutdown_tx, _) = broadcast::channel(8);
        let processor_handle =
            tokio::spawn(Arc::clone(&services.processor).serve(shutdown_tx.subscribe()));
        let control_rx = shutdown_tx.subscribe();
        let control_handle = tokio::spawn(async move {
            if let Err(e) = server.serve(control_rx).await {
                eprintln!("Control server error: {e}");
            }
        });

        let harness = E2ETestHarness {
            herald: self.herald,
            services,
            transport,
            audit,
            socket_path,
            _socket_dir: socket_dir,
            shutdown_tx,
            processor_handle,
            control_handle,
        };
        harness.wait_for_socket().await;
        harness
    }
}

pub struct E2ETestHarness {
    pub herald: Herald,
    pub services: Services,
    pub transport: Arc<ScriptedTransport>,
    pub audit: Arc<MemoryAuditSink>,
    socket_path: String,
    _socket_dir: TempDir,
    shutdown_tx: broadcast::Sender<Signal>,
    processor_handle: JoinHandle<Result<(), DeliveryError>>,
    control_handle: JoinHandle<()>,
}

impl E2ETestHarness {
    /// Create a new builder for configuring the test harness
    #[must_use]
    pub fn builder() -> E2ETestHarnessBuilder {
        E2ETestHarnessBuilder::new()
    }

    /// A client holding every permission
    pub fn client(&self) -> ControlClient {
        self.client_with(OPS_TOKEN)
    }

    pub fn client_with(&self, token: &str) -> ControlClient {
        ControlClient::new(&self.socket_path).with_token(token)
    }

    pub fn anonymous_client(&self) -> ControlClient {
        ControlClient::new(&self.socket_path)
    }

    async fn wait_for_socket(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !std::path::Path::new(&self.socket_path).exists() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "control socket did not come up"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the campaign reaches `status`
    pub async fn wait_for_campaign(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
        within: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + within;

        while tokio::time::Instant::now() < deadline {
            let current = self
                .services
                .campaigns
                .get_campaign(campaign_id)
                .await
                .expect("campaign exists")
                .status;
            if current == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        false
    }

    /// Stop the worker pool and control socket, then save the queue if a
    /// snapshot path is configured
    ///
    /// # Panics
    ///
    /// Panics if the pool does not stop within 5 seconds or the snapshot
    /// cannot be written.
    pub async fn shutdown(self) {
        let Self {
            herald,
            services,
            shutdown_tx,
            processor_handle,
            control_handle,
            ..
        } = self;

        let _ = shutdown_tx.send(Signal::Shutdown);

        timeout(Duration::from_secs(5), async move {
            let _ = processor_handle.await;
            let _ = control_handle.await;
        })
        .await
        .expect("pipeline did not stop");

        if let Some(path) = &herald.snapshot_path {
            services.jobs.save(path).await.expect("save snapshot");
        }
    }
}
