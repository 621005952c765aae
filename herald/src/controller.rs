use std::{path::PathBuf, sync::Arc, sync::LazyLock, time::Duration};

use herald_common::{
    Signal,
    audit::{self, AuditConfig, AuditSink, TracingAuditSink},
    internal,
    logging::{self, LoggingConfig},
};
use herald_control::{ControlAuthConfig, ControlServer, DEFAULT_CONTROL_SOCKET, TokenAuthorizer};
use herald_delivery::{
    Audience, Campaign, DeliveryConfig, DeliveryError, DeliveryProcessor, LogTransport,
    MailTransport, MemoryCampaignStore, StatsAggregator, Subscriber, SubscriberStatus,
};
use herald_metrics::MetricsConfig;
use herald_queue::MemoryJobStore;
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinError};

use crate::control_handler::HeraldControlHandler;

mod defaults {
    pub fn socket_path() -> String {
        super::DEFAULT_CONTROL_SOCKET.to_string()
    }

    pub const fn stats_interval_secs() -> u64 {
        15
    }

    pub const fn verified() -> super::SubscriberStatus {
        super::SubscriberStatus::Verified
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "defaults::socket_path")]
    pub socket_path: String,

    #[serde(default)]
    pub auth: ControlAuthConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: defaults::socket_path(),
            auth: ControlAuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedSubscriber {
    pub id: String,
    pub email: String,
    #[serde(default = "defaults::verified")]
    pub status: SubscriberStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedCampaign {
    pub id: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub audience: Audience,
}

/// Campaigns and subscribers loaded into the in-memory content store at start
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub subscribers: Vec<SeedSubscriber>,
    #[serde(default)]
    pub campaigns: Vec<SeedCampaign>,
}

#[derive(Debug, Deserialize)]
pub struct Herald {
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Where the queue is persisted between runs; in-memory only when unset
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    /// How often queue gauges are pushed to metrics
    #[serde(default = "defaults::stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default)]
    pub seed: Seed,
}

impl Default for Herald {
    fn default() -> Self {
        Self {
            delivery: DeliveryConfig::default(),
            control: ControlConfig::default(),
            logging: LoggingConfig::default(),
            audit: AuditConfig::default(),
            metrics: MetricsConfig::default(),
            snapshot_path: None,
            stats_interval_secs: defaults::stats_interval_secs(),
            seed: Seed::default(),
        }
    }
}

/// The wired pipeline, before anything is running
pub struct Services {
    pub jobs: Arc<MemoryJobStore>,
    pub campaigns: Arc<MemoryCampaignStore>,
    pub processor: Arc<DeliveryProcessor>,
    pub stats: StatsAggregator,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = tracing::Level::TRACE)]
async fn wait_for_signal() -> std::io::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            internal!(level = INFO, "CTRL+C entered, finishing in-flight jobs");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

/// Push queue gauges until shutdown
async fn publish_stats(
    stats: StatsAggregator,
    every: Duration,
    mut shutdown: broadcast::Receiver<Signal>,
) {
    if !herald_metrics::is_enabled() {
        return;
    }

    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = stats.publish_metrics().await {
                    tracing::warn!(error = %e, "Failed to publish queue metrics");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

fn flatten(joined: Result<Result<(), DeliveryError>, JoinError>) -> anyhow::Result<()> {
    Ok(joined??)
}

impl Herald {
    /// Build the queue, content store and worker pool
    ///
    /// Restores the queue from `snapshot_path` when one exists, then loads the
    /// seed campaigns and subscribers.
    ///
    /// # Errors
    ///
    /// If the snapshot exists but cannot be read.
    pub async fn services(&self, transport: Arc<dyn MailTransport>) -> anyhow::Result<Services> {
        let jobs = Arc::new(match &self.snapshot_path {
            Some(path) => MemoryJobStore::load(path, self.delivery.retry.clone()).await?,
            None => MemoryJobStore::new(self.delivery.retry.clone()),
        });

        let campaigns = Arc::new(MemoryCampaignStore::new());
        for subscriber in &self.seed.subscribers {
            campaigns.insert_subscriber(Subscriber::new(
                subscriber.id.clone(),
                subscriber.email.clone(),
                subscriber.status,
            ));
        }
        for campaign in &self.seed.campaigns {
            campaigns.insert_campaign(Campaign::draft(
                campaign.id.clone(),
                campaign.subject.clone(),
                campaign.body.clone(),
                campaign.audience,
            ));
        }

        let processor = Arc::new(DeliveryProcessor::new(
            self.delivery.clone(),
            jobs.clone(),
            campaigns.clone(),
            transport,
        ));

        let stats = StatsAggregator::new(
            jobs.clone(),
            campaigns.clone(),
            processor.breaker(),
            processor.backpressure(),
        );

        Ok(Services {
            jobs,
            campaigns,
            processor,
            stats,
        })
    }

    /// Control handler using the configured token authorizer
    #[must_use]
    pub fn control_handler(
        &self,
        services: &Services,
        audit: Arc<dyn AuditSink>,
    ) -> HeraldControlHandler {
        HeraldControlHandler::new(
            &services.processor,
            services.stats.clone(),
            Arc::new(TokenAuthorizer::new(self.control.auth.clone())),
            audit,
        )
    }

    /// Run the pipeline and the control socket until a shutdown signal
    ///
    /// Workers finish the job they hold before the queue is saved.
    ///
    /// # Errors
    ///
    /// This function will return an error if the snapshot cannot be loaded or
    /// saved, the control socket cannot be bound, or the worker pool stops on a
    /// fatal queue error.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init(&self.logging);
        audit::init(self.audit.clone());
        herald_metrics::init_metrics(&self.metrics)?;

        let services = self.services(Arc::new(LogTransport)).await?;
        let recovered = services.jobs.len();
        internal!(level = INFO, "Queue loaded with {} jobs", recovered);

        let handler = Arc::new(self.control_handler(&services, Arc::new(TracingAuditSink)));
        let control = ControlServer::new(self.control.socket_path.clone(), handler)?;

        internal!("Controller running");

        let mut processor = tokio::spawn(
            Arc::clone(&services.processor).serve(SHUTDOWN_BROADCAST.subscribe()),
        );
        let control_rx = SHUTDOWN_BROADCAST.subscribe();
        let mut control = tokio::spawn(async move { control.serve(control_rx).await });
        let stats = tokio::spawn(publish_stats(
            services.stats.clone(),
            Duration::from_secs(self.stats_interval_secs.max(1)),
            SHUTDOWN_BROADCAST.subscribe(),
        ));

        let mut processor_result = None;
        let mut control_result = None;
        tokio::select! {
            r = wait_for_signal() => {
                if let Err(e) = r {
                    tracing::error!(error = %e, "Signal handling failed, shutting down");
                }
            }
            joined = &mut processor => {
                processor_result = Some(flatten(joined));
            }
            joined = &mut control => {
                control_result = Some(joined);
            }
        };

        internal!(level = INFO, "Shutting down...");
        let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);

        let processor_result = match processor_result {
            Some(result) => result,
            None => flatten(processor.await),
        };
        let control_result = match control_result {
            Some(joined) => joined,
            None => control.await,
        };
        let _ = stats.await;

        if let Some(path) = &self.snapshot_path {
            services.jobs.save(path).await?;
            internal!(level = INFO, "Queue saved to {}", path.display());
        }
        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);

        processor_result?;
        control_result??;
        Ok(())
    }
}
