//! Cursor-based polling loop.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::Deserialize;

use crate::client::{ClientFactory, Message, StreamClient};
use crate::controller::{FailoverController, OpKind};
use crate::error::{Error, Result};
use crate::retry::millis;
use crate::shutdown::ShutdownFlag;
use crate::sleeper::{Sleeper, ThreadSleeper};
use crate::target::{CursorPosition, CursorState, TargetRef};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub partition: String,
    pub batch_limit: usize,
    #[serde(rename = "poll_interval_ms", deserialize_with = "millis::deserialize")]
    pub poll_interval: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            partition: "0".to_string(),
            batch_limit: 20,
            poll_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A fetch succeeded and this many messages were emitted (possibly zero).
    Delivered(usize),
    /// The controller moved to `target`; the old cursor was dropped.
    CursorReset { target: TargetRef },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub polls: u64,
    pub delivered: u64,
    pub failed_polls: u64,
}

pub struct ConsumerLoop<F: ClientFactory> {
    controller: FailoverController<F>,
    settings: ConsumerSettings,
    sleeper: Arc<dyn Sleeper>,
    cursor: Option<CursorState>,
}

impl<F: ClientFactory> ConsumerLoop<F> {
    pub fn new(controller: FailoverController<F>, settings: ConsumerSettings) -> Self {
        Self {
            controller,
            settings,
            sleeper: Arc::new(ThreadSleeper),
            cursor: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn controller(&self) -> &FailoverController<F> {
        &self.controller
    }

    pub fn cursor(&self) -> Option<&CursorState> {
        self.cursor.as_ref()
    }

    /// One polling cycle: make sure a cursor exists for the active target,
    /// fetch one batch, hand every message to `sink` in arrival order and
    /// advance the cursor.
    ///
    /// Errors other than a failover leave the cursor in place so the next
    /// cycle resumes where this one stopped.
    pub fn poll_once<S>(&mut self, sink: &mut S) -> Result<PollOutcome>
    where
        S: FnMut(&TargetRef, &Message),
    {
        let state = match self.cursor.take() {
            Some(state) if state.belongs_to(self.controller.active_target()) => state,
            _ => match self.open_cursor() {
                Ok(state) => state,
                Err(err) => return self.absorb_failover(err),
            },
        };

        let limit = self.settings.batch_limit;
        let fetched = self.controller.execute(OpKind::Fetch, |client, target| {
            client.fetch(&target.id, &state.cursor, limit)
        });
        let batch = match fetched {
            Ok(batch) => batch,
            Err(err) => {
                self.cursor = Some(state);
                return self.absorb_failover(err);
            }
        };

        if batch.messages.is_empty() {
            info!("No messages available.");
        }
        for message in &batch.messages {
            sink(&state.target, message);
        }
        let delivered = batch.messages.len();
        self.cursor = Some(CursorState {
            target: state.target,
            cursor: batch.next_cursor,
        });
        Ok(PollOutcome::Delivered(delivered))
    }

    /// Poll until `shutdown` is raised, sleeping the poll interval between
    /// cycles. Individual failures are logged and never end the loop.
    pub fn run<S>(&mut self, shutdown: &ShutdownFlag, sink: &mut S) -> ConsumerReport
    where
        S: FnMut(&TargetRef, &Message),
    {
        let mut report = ConsumerReport::default();
        while !shutdown.is_raised() {
            report.polls += 1;
            match self.poll_once(sink) {
                Ok(PollOutcome::Delivered(count)) => report.delivered += count as u64,
                Ok(PollOutcome::CursorReset { target }) => {
                    info!("FAILOVER: now consuming from secondary stream {target}");
                }
                Err(Error::Resolution(reason)) => {
                    report.failed_polls += 1;
                    warn!("No secondary detected yet ({reason}). Retrying primary...");
                }
                Err(err) => {
                    report.failed_polls += 1;
                    error!("consumer error: {}", err.chain());
                }
            }
            self.sleeper.sleep(self.settings.poll_interval);
        }
        info!(
            "consumer stopped after {} polls, {} messages",
            report.polls, report.delivered
        );
        report
    }

    fn open_cursor(&mut self) -> Result<CursorState> {
        let partition = self.settings.partition.as_str();
        let cursor = self.controller.execute(OpKind::CreateCursor, |client, target| {
            client.create_cursor(&target.id, partition, CursorPosition::TrimHorizon)
        })?;
        let target = self.controller.active_target().clone();
        info!("opened trim-horizon cursor on {target} partition {partition}");
        Ok(CursorState { target, cursor })
    }

    fn absorb_failover(&mut self, err: Error) -> Result<PollOutcome> {
        if !err.is_failover() {
            return Err(err);
        }
        self.cursor = None;
        Ok(PollOutcome::CursorReset {
            target: self.controller.active_target().clone(),
        })
    }
}
