//! Device lifecycle
//!
//! `DeviceRunner` opens the device connection and the optional application
//! connection; `DeviceSession` owns everything that runs on one open device
//! connection: the rate regulator, the command responder and the publish loop.

use crate::appmode::FifoConsumer;
use crate::commands::CommandResponder;
use crate::config::DeviceConfig;
use crate::encoder::{Encoder, EncoderKind};
use crate::error::{ClientError, ClientResult};
use crate::observability::{ClientMetrics, MetricsSnapshot};
use crate::publisher::{LoopExit, LoopReport, PublishLoop};
use crate::regulator::RateRegulator;
use crate::transport::mqtt::{ConnectionManager, ConnectionState, Identity};
use crate::transport::Transport;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Hands out device indices 1, 2, 3, ... without a shared mutable counter
#[derive(Debug)]
pub struct DeviceIdAllocator {
    next: AtomicU32,
}

impl DeviceIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for DeviceIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one device run
#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub loop_report: LoopReport,
    pub commands_enabled: bool,
    pub drained: bool,
    pub metrics: MetricsSnapshot,
}

/// Everything running on one open device connection
pub struct DeviceSession<T: Transport + 'static> {
    config: DeviceConfig,
    transport: Arc<T>,
    encoder: Box<dyn Encoder>,
    metrics: Arc<ClientMetrics>,
}

impl<T: Transport + 'static> DeviceSession<T> {
    pub fn new(config: DeviceConfig, transport: Arc<T>, encoder: Box<dyn Encoder>) -> Self {
        Self {
            config,
            transport,
            encoder,
            metrics: Arc::new(ClientMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// Subscribe commands, run the publish loop, drain and disconnect
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> DeviceReport {
        let DeviceSession {
            config,
            transport,
            encoder,
            metrics,
        } = self;

        metrics.connection_established();
        let regulator = Arc::new(RateRegulator::with_metrics(
            transport.clone(),
            config.min_publish_interval(),
            metrics.clone(),
        ));

        let responder = if config.commands.enabled {
            let responder = Arc::new(CommandResponder::from_config(
                regulator.clone(),
                &config.commands,
            ));
            match responder.subscribe().await {
                Ok(()) => Some(responder),
                Err(e) => {
                    error!(error = %e.sanitized(), "Command handling disabled");
                    None
                }
            }
        } else {
            None
        };

        let publish_loop = PublishLoop::from_config(regulator.clone(), encoder, &config);
        let loop_report = publish_loop.run(shutdown, transport.watch_state()).await;
        info!(
            attempts = loop_report.attempts,
            failures = loop_report.failures,
            exit = ?loop_report.exit,
            "Publish loop finished"
        );

        let drained = match &responder {
            Some(responder) => responder.drain(config.drain_timeout()).await,
            None => true,
        };

        if let Err(e) = transport.disconnect().await {
            let error = ClientError::network(e.to_string());
            warn!(error = %error.sanitized(), "Disconnect failed");
        }
        let lost = matches!(loop_report.exit, LoopExit::ConnectionLost(_))
            || matches!(transport.connection_state(), ConnectionState::Lost(_));
        if lost && responder.is_none() {
            // the responder counts the loss itself when it is registered
            metrics.connection_lost();
        }
        metrics.connection_closed();

        let snapshot = metrics.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(metrics = %json, "Device metrics"),
            Err(e) => warn!(error = %e, "Failed to serialize metrics"),
        }

        DeviceReport {
            loop_report,
            commands_enabled: responder.is_some(),
            drained,
            metrics: snapshot,
        }
    }
}

/// One simulated device: connect, run a session, tear down
pub struct DeviceRunner {
    config: DeviceConfig,
    manager: ConnectionManager,
    index: u32,
}

impl DeviceRunner {
    pub fn new(config: DeviceConfig, manager: ConnectionManager, index: u32) -> Self {
        Self {
            config,
            manager,
            index,
        }
    }

    pub fn identity(&self) -> Identity {
        Identity::device(&self.config.device.urn_prefix, self.index)
    }

    /// Fails only on connect-time errors; everything later is logged
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> ClientResult<DeviceReport> {
        let encoder = EncoderKind::from_config(&self.config.publish)?;
        let identity = self.identity();
        info!(client_id = %identity.client_id(), "Starting device");

        let connection = self.manager.connect(identity).await?;

        let fifo = if self.config.appmode.enabled {
            match FifoConsumer::start(&self.manager, &self.config.appmode.fifo).await {
                Ok(consumer) => Some(consumer),
                Err(e) => {
                    error!(error = %e.sanitized(), "Application mode not started");
                    None
                }
            }
        } else {
            None
        };

        let report = DeviceSession::new(self.config.clone(), connection, encoder)
            .run(shutdown)
            .await;

        if let Some(consumer) = fifo {
            consumer.stop().await;
        }

        info!(index = self.index, "Device stopped");
        Ok(report)
    }
}
