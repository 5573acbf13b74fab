// Queue-driven task processing: consume with a prefetch equal to the
// sandbox pool size, replay cached results idempotently, retry faults
// with exponential backoff, dead-letter after the retry budget, and
// supervise the broker and cache connections.

use crate::errors::ExecError;
use crate::orchestrator::Orchestrator;
use crucible_common::cache::Cache;
use crucible_common::config::Config;
use crucible_common::types::{FailureResult, Task};
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const CONNECT_MAX_RETRIES: u32 = 5;
const CONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// What to do with a faulted task on its nth failure.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryAction {
    /// Nack with requeue after the given delay.
    Requeue(Duration),
    /// Nack without requeue, routing to the dead-letter queue.
    DeadLetter,
}

/// Delay doubles per attempt: 2s, 4s, 8s, ...
pub fn retry_action(retries: u32, max_retries: u32) -> RetryAction {
    if retries <= max_retries {
        RetryAction::Requeue(Duration::from_secs(2u64.pow(retries)))
    } else {
        RetryAction::DeadLetter
    }
}

struct WorkerInner {
    config: Config,
    cache: Cache,
    orchestrator: Orchestrator,
    /// Process-local retry counters, keyed by task id. Deliberately
    /// volatile: a redelivery after a crash restarts the count.
    retry_counts: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct QueueWorker {
    inner: Arc<WorkerInner>,
}

/// Keeps the in-flight count honest on every exit path.
struct InFlightGuard(Arc<WorkerInner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl QueueWorker {
    pub fn new(config: Config, cache: Cache, orchestrator: Orchestrator) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                config,
                cache,
                orchestrator,
                retry_counts: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Consume until the process shuts down. Any session failure
    /// (connection error, channel close, consumer stream end) tears
    /// the session down and reconnects after a fixed delay, forever.
    pub async fn run(&self) {
        loop {
            match self.consume_session().await {
                Ok(()) => info!("broker session ended, reconnecting"),
                Err(e) => error!(error = %e, "broker session failed"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_broker(&self) -> anyhow::Result<Connection> {
        let url = &self.inner.config.rabbitmq.url;
        let mut attempt = 1;
        loop {
            match Connection::connect(url, ConnectionProperties::default()).await {
                Ok(conn) => {
                    info!(url = %url, "connected to broker");
                    return Ok(conn);
                }
                Err(e) if attempt < CONNECT_MAX_RETRIES => {
                    let delay = CONNECT_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts = CONNECT_MAX_RETRIES,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn consume_session(&self) -> anyhow::Result<()> {
        let rabbitmq = &self.inner.config.rabbitmq;
        let conn = self.connect_broker().await?;
        let channel = conn.create_channel().await?;

        // Faulted tasks that exhaust their retries are routed by the
        // broker to the dead-letter exchange declared here.
        let mut dead_letter_args = FieldTable::default();
        dead_letter_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("dlx".into()),
        );
        dead_letter_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString("failed-executions".into()),
        );
        channel
            .queue_declare(
                &rabbitmq.execution_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                dead_letter_args,
            )
            .await?;
        channel
            .queue_declare(
                &rabbitmq.results_queue,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // Prefetch = concurrency = pool size, so the broker never
        // hands us more tasks than the pools can hold.
        channel
            .basic_qos(
                self.inner.config.worker.concurrency,
                BasicQosOptions::default(),
            )
            .await?;

        let mut consumer = channel
            .basic_consume(
                &rabbitmq.execution_queue,
                "crucible-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %rabbitmq.execution_queue,
            prefetch = self.inner.config.worker.concurrency,
            "consuming execution queue"
        );

        let probe = self.spawn_health_probe(&conn);

        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    let worker = self.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        worker.process_delivery(channel, delivery).await;
                    });
                }
                Err(e) => {
                    probe.abort();
                    return Err(e.into());
                }
            }
        }

        probe.abort();
        Ok(())
    }

    /// Periodically verify the cache answers and the broker connection
    /// is still up. A dead broker connection ends the probe, which the
    /// consumer stream mirrors, recycling the whole session.
    fn spawn_health_probe(&self, conn: &Connection) -> tokio::task::JoinHandle<()> {
        let status = conn.status().clone();
        let cache = self.inner.cache.clone();
        let interval = self.inner.config.worker.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut cache = cache.clone();
                match cache.ping().await {
                    Ok(()) => debug!("cache health check ok"),
                    Err(e) => error!(error = %e, "cache health check failed"),
                }
                if !status.connected() {
                    error!("broker connection lost");
                    break;
                }
            }
        })
    }

    async fn process_delivery(&self, channel: Channel, delivery: Delivery) {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(self.inner.clone());

        let task: Task = match serde_json::from_slice(&delivery.data) {
            Ok(task) => task,
            Err(e) => {
                // No task id to count retries against; dead-letter the
                // poison message immediately.
                error!(error = %e, "discarding unparseable task message");
                if let Err(e) = delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
                {
                    error!(error = %e, "failed to nack poison message");
                }
                return;
            }
        };

        let task_id = task.task_id.clone();
        match self.process_task(&channel, &task).await {
            Ok(()) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(task_id = %task_id, error = %e, "failed to ack task");
                }
                self.clear_retries(&task_id);
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "task processing failed");
                self.handle_failure(channel, delivery, &task_id).await;
            }
        }
    }

    async fn process_task(&self, channel: &Channel, task: &Task) -> anyhow::Result<()> {
        let mut cache = self.inner.cache.clone();

        // Redelivery after a crash between execution and ack replays
        // the cached result instead of re-executing the code.
        if let Some(cached) = cache.get_result(&task.task_id).await? {
            info!(task_id = %task.task_id, "cached result found, republishing");
            self.publish(channel, cached.into_bytes()).await?;
            return Ok(());
        }

        info!(
            task_id = %task.task_id,
            language = %task.language,
            test_cases = task.test_cases.len(),
            code_size = task.code.len(),
            "executing task"
        );
        let started = Instant::now();
        let result = self
            .inner
            .orchestrator
            .run(task)
            .await
            .map_err(|e: ExecError| anyhow::anyhow!(e))?;
        info!(
            task_id = %task.task_id,
            success = result.success,
            total_execution_ms = result.total_execution_time,
            wall_ms = started.elapsed().as_millis() as u64,
            "execution completed"
        );

        let payload = serde_json::to_string(&result)?;
        cache.store_result(&task.task_id, &payload).await?;
        self.publish(channel, payload.into_bytes()).await?;
        Ok(())
    }

    async fn publish(&self, channel: &Channel, payload: Vec<u8>) -> anyhow::Result<()> {
        channel
            .basic_publish(
                "",
                &self.inner.config.rabbitmq.results_queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn handle_failure(&self, channel: Channel, delivery: Delivery, task_id: &str) {
        let retries = {
            let mut counts = self.inner.retry_counts.lock().expect("retry counter lock");
            let count = counts.entry(task_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let max_retries = self.inner.config.worker.max_retries;

        match retry_action(retries, max_retries) {
            RetryAction::Requeue(delay) => {
                warn!(
                    task_id = %task_id,
                    retries,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling retry"
                );
                let task_id = task_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await
                    {
                        error!(task_id = %task_id, error = %e, "failed to requeue task");
                    }
                });
            }
            RetryAction::DeadLetter => {
                warn!(task_id = %task_id, retries, "retry budget exhausted, dead-lettering task");
                if let Err(e) = delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
                {
                    error!(task_id = %task_id, error = %e, "failed to dead-letter task");
                }
                self.clear_retries(task_id);

                // Publish a terminal failure so status polling resolves
                // instead of hanging on "pending" forever.
                let failure = FailureResult::max_retries_exceeded(task_id);
                match serde_json::to_vec(&failure) {
                    Ok(payload) => {
                        if let Err(e) = self.publish(&channel, payload).await {
                            error!(task_id = %task_id, error = %e, "failed to publish failure result");
                        }
                    }
                    Err(e) => error!(task_id = %task_id, error = %e, "failed to encode failure result"),
                }
            }
        }
    }

    fn clear_retries(&self, task_id: &str) {
        self.inner
            .retry_counts
            .lock()
            .expect("retry counter lock")
            .remove(task_id);
    }

    /// Wait for in-flight executions to finish, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let in_flight = self.inner.in_flight.load(Ordering::SeqCst);
            if in_flight == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(in_flight, "shutdown drain timed out, abandoning in-flight tasks");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
