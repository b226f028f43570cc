use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::pipeline::{Consumer, DecodedSample, IntakeReceiver};
use crate::logging::Logger;

/// Backlog above which a consumer is reported as lagging.
pub const LAG_WARNING_THRESHOLD: usize = 300;
/// Minimum time between two lag warnings for the same consumer.
pub const LAG_WARNING_COOLDOWN: Duration = Duration::from_secs(60);

struct Registered {
    consumer: Arc<dyn Consumer>,
    last_lag_warning: Option<Instant>,
}

/// Distributes samples from the intake queue to every consumer.
pub struct Fanout {
    intake: IntakeReceiver,
    consumers: Vec<Registered>,
    halt: CancellationToken,
    log: Logger,
}

impl Fanout {
    pub fn new(intake: IntakeReceiver, halt: CancellationToken, log: Logger) -> Self {
        Self {
            intake,
            consumers: Vec::new(),
            halt,
            log,
        }
    }

    pub fn add_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        self.consumers.push(Registered {
            consumer,
            last_lag_warning: None,
        });
    }

    /// Runs until halted and the intake is closed and empty, then waits for every
    /// consumer to work off its backlog.
    pub async fn run(mut self) {
        let drained = CancellationToken::new();
        let tasks = self.launch_consumers(&drained);

        if let Err(e) = self.distribute().await {
            self.log
                .error(format_args!("Fan-out encountered an error: {:#}", e));
            self.halt.cancel();
        }

        let backlog: usize = self.consumers.iter().map(|c| c.consumer.backlog()).sum();
        if backlog > 0 {
            self.log.info(format_args!(
                "Fan-out ready to shut down. Waiting for {} items in consumer queues...",
                backlog
            ));
        }
        drained.cancel();

        for (name, task) in tasks {
            if let Err(e) = task.await {
                self.log
                    .error(format_args!("Consumer {} task failed: {}", name, e));
                self.halt.cancel();
            }
        }
        self.log.info("Fan-out shut down");
    }

    /// Spawns every consumer. A consumer error raises halt right away.
    fn launch_consumers(&self, drained: &CancellationToken) -> Vec<(String, JoinHandle<()>)> {
        self.consumers
            .iter()
            .map(|c| {
                let consumer = c.consumer.clone();
                let drained = drained.clone();
                let halt = self.halt.clone();
                let log = self.log.clone();
                let name = consumer.name().to_string();
                self.log.info(format_args!("Consumer {} enabled", name));
                let task = tokio::spawn(async move {
                    if let Err(e) = consumer.run(drained).await {
                        log.error(format_args!("Consumer {} failed: {:#}", consumer.name(), e));
                        halt.cancel();
                    }
                });
                (name, task)
            })
            .collect()
    }

    async fn distribute(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                next = self.intake.recv() => match next {
                    Some(sample) => self.dispatch(sample),
                    // Producers are gone; with halt raised this is the normal end.
                    None if self.halt.is_cancelled() => return Ok(()),
                    None => bail!("intake queue closed while the session is running"),
                },
                _ = self.halt.cancelled() => {
                    // Keep receiving until the last producer has let go of the intake.
                    while let Some(sample) = self.intake.recv().await {
                        self.dispatch(sample);
                    }
                    return Ok(());
                }
            }
            self.monitor_lag(Instant::now());
        }
    }

    fn dispatch(&self, sample: Arc<DecodedSample>) {
        for registered in &self.consumers {
            // A refusal is logged by the consumer's own queue.
            registered.consumer.accept(sample.clone());
        }
    }

    fn monitor_lag(&mut self, now: Instant) {
        for registered in &mut self.consumers {
            let backlog = registered.consumer.backlog();
            if backlog <= LAG_WARNING_THRESHOLD {
                continue;
            }
            let cooled_down = registered
                .last_lag_warning
                .map_or(true, |at| now.saturating_duration_since(at) >= LAG_WARNING_COOLDOWN);
            if cooled_down {
                self.log.warn(format_args!(
                    "The input queue of consumer {} has {} items, consumers are lagging!",
                    registered.consumer.name(),
                    backlog
                ));
                registered.last_lag_warning = Some(now);
            }
        }
    }
}
