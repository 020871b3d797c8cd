//! The probe scheduling loop.
//!
//! One cooperative loop, one in-flight send. A send that overruns the
//! interval causes the overlapping tick to be skipped rather than queued,
//! so collection and delivery never pile up behind each other. Send
//! errors never crash the agent: a sample either reaches a gateway or
//! ages out of the head of the bounded buffer.

use fiber_core::trace::TraceId;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::SampleBuffer;
use crate::collector::Collector;
use crate::config::ProbeConfig;
use crate::failover::{Failover, Target};
use crate::sender::{SendOutcome, Sender};
use crate::ProbeError;

pub struct Agent {
    config: ProbeConfig,
    collector: Collector,
    sender: Sender,
    failover: Failover,
    buffer: SampleBuffer,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(config: ProbeConfig, cancel: CancellationToken) -> Result<Self, ProbeError> {
        config.validate()?;
        Ok(Agent {
            collector: Collector::new(config.clone()),
            sender: Sender::new(config.clone())?,
            failover: Failover::new(config.regional_endpoint.is_some(), config.stickiness),
            buffer: SampleBuffer::new(config.max_buffer),
            cancel,
            config,
        })
    }

    fn endpoint(&self, target: Target) -> &str {
        match target {
            Target::Regional => self
                .config
                .regional_endpoint
                .as_deref()
                .unwrap_or(&self.config.api_endpoint),
            Target::Central => &self.config.api_endpoint,
        }
    }

    /// Runs until cancelled, then flushes what the grace period allows.
    pub async fn run(mut self) {
        info!(
            node_id = %self.config.node_id,
            interval_s = self.config.interval.as_secs(),
            "probe agent started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        // skip overlapped ticks instead of bursting them after a slow send
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                () = cancel.cancelled() => break,
            }
        }

        self.shutdown_flush().await;
        info!(
            buffered = self.buffer.len(),
            dropped = self.buffer.dropped_total(),
            "probe agent stopped"
        );
    }

    async fn tick(&mut self) {
        let sample = self.collector.collect().await;
        let trace = TraceId::generate();
        let target = self.failover.target();
        let endpoint = self.endpoint(target).to_string();

        match self.sender.send_sample(&endpoint, &sample, &trace).await {
            SendOutcome::Delivered => {
                self.failover.record(target, true);
                self.flush_buffered(&endpoint, &trace).await;
            }
            SendOutcome::Rejected => {
                // endpoint is reachable, the payload is the problem
                self.failover.record(target, true);
                error!(trace_id = trace.as_str(), "sample rejected by gateway, dropping");
            }
            SendOutcome::Failed => {
                self.failover.record(target, false);
                warn!(
                    trace_id = trace.as_str(),
                    buffered = self.buffer.len() + 1,
                    "uplink down, buffering sample"
                );
                self.buffer.push(sample);
            }
        }
    }

    /// Drains one batch of buffered samples between live sends. The batch
    /// inherits the trace id of the send that proved the uplink healthy.
    async fn flush_buffered(&mut self, endpoint: &str, trace: &TraceId) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = self.buffer.drain_batch(self.config.flush_batch);
        let count = batch.len();
        match self.sender.send_batch(endpoint, &batch, trace).await {
            SendOutcome::Delivered => {
                debug!(count, remaining = self.buffer.len(), "flushed buffered samples");
            }
            SendOutcome::Rejected => {
                error!(count, "buffered batch rejected, dropping");
            }
            SendOutcome::Failed => {
                self.buffer.requeue_front(batch);
            }
        }
    }

    /// Best-effort drain within the shutdown grace period.
    async fn shutdown_flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        info!(buffered = self.buffer.len(), "flushing buffer before exit");
        let endpoint = self.endpoint(self.failover.target()).to_string();
        let trace = TraceId::generate();
        let grace = self.config.shutdown_grace;

        let drained = tokio::time::timeout(grace, async {
            while !self.buffer.is_empty() {
                let batch = self.buffer.drain_batch(self.config.flush_batch);
                match self.sender.send_batch(&endpoint, &batch, &trace).await {
                    SendOutcome::Delivered => {}
                    SendOutcome::Rejected => break,
                    SendOutcome::Failed => {
                        self.buffer.requeue_front(batch);
                        break;
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = self.buffer.len(), "shutdown grace expired with samples unflushed");
        }
    }
}
