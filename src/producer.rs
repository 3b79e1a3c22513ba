//! Message submission loop.
//!
//! Each message gets one attempt chain: retries on the active target, then
//! (from the primary) a failover and retries on the secondary. A message
//! whose chain fails is counted as undelivered and never re-sent.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use serde::Deserialize;

use crate::client::{ClientFactory, StreamClient};
use crate::controller::{FailoverController, OpKind};
use crate::retry::millis;
use crate::shutdown::ShutdownFlag;
use crate::sleeper::{Sleeper, ThreadSleeper};
use crate::target::TargetRef;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    /// Partition key attached to every message.
    pub key: String,
    #[serde(rename = "interval_ms", deserialize_with = "millis::deserialize")]
    pub interval: Duration,
    /// How many messages the bundled producer binary sends.
    pub message_count: u64,
    pub message_prefix: String,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            key: "k".to_string(),
            interval: Duration::from_millis(200),
            message_count: 2000,
            message_prefix: "message-".to_string(),
        }
    }
}

impl ProducerSettings {
    /// `<prefix>1` through `<prefix><message_count>`.
    pub fn messages(&self) -> impl Iterator<Item = String> + '_ {
        (1..=self.message_count).map(move |i| format!("{}{i}", self.message_prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered { target: TargetRef },
    Undelivered { reason: String },
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub delivered: u64,
    pub undelivered: u64,
}

pub struct ProducerLoop<F: ClientFactory> {
    controller: FailoverController<F>,
    settings: ProducerSettings,
    sleeper: Arc<dyn Sleeper>,
}

impl<F: ClientFactory> ProducerLoop<F> {
    pub fn new(controller: FailoverController<F>, settings: ProducerSettings) -> Self {
        Self {
            controller,
            settings,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn controller(&self) -> &FailoverController<F> {
        &self.controller
    }

    /// Submit one message through the controller.
    pub fn send(&mut self, payload: &[u8]) -> Delivery {
        let key = self.settings.key.as_bytes();
        let sent = self.controller.execute(OpKind::Put, |client, target| {
            client.put(&target.id, key, payload)
        });
        match sent {
            Ok(()) => Delivery::Delivered {
                target: self.controller.active_target().clone(),
            },
            Err(err) => {
                let reason = err.chain();
                error!("Failed to deliver message after HA attempts: {reason}");
                Delivery::Undelivered { reason }
            }
        }
    }

    /// Send every message from `messages`, pausing the configured interval
    /// after each one, until the iterator ends or `shutdown` is raised.
    pub fn run<I, M>(&mut self, messages: I, shutdown: &ShutdownFlag) -> ProducerReport
    where
        I: IntoIterator<Item = M>,
        M: AsRef<[u8]>,
    {
        let mut report = ProducerReport::default();
        for message in messages {
            if shutdown.is_raised() {
                info!("shutdown requested, stopping producer");
                break;
            }
            match self.send(message.as_ref()) {
                Delivery::Delivered { .. } => report.delivered += 1,
                Delivery::Undelivered { .. } => report.undelivered += 1,
            }
            self.sleeper.sleep(self.settings.interval);
        }
        info!(
            "producer finished: {} delivered, {} undelivered",
            report.delivered, report.undelivered
        );
        report
    }
}
