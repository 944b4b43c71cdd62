//! Worker - the acknowledgement layer between the broker and the router.
//!
//! A worker decodes a delivery, dispatches it, and settles it: ack on
//! success, requeue with backoff or dead-letter on failure, as the decider
//! says. The ledger is kept in step but never blocks settlement.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use super::decision::{Decider, Decision};
use super::router::StageRouter;
use super::status::WorkerMetrics;
use crate::domain::{BrokerError, Stage, TaskEnvelope};
use crate::ports::{Broker, Consumer, Delivery, TaskLedger};

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Acked,
    Requeued { delay: Duration },
    DeadLettered { reason: String },
}

pub struct Worker {
    router: Arc<StageRouter>,
    ledger: Arc<dyn TaskLedger>,
    decider: Arc<dyn Decider>,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    pub fn new(
        router: Arc<StageRouter>,
        ledger: Arc<dyn TaskLedger>,
        decider: Arc<dyn Decider>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            router,
            ledger,
            decider,
            metrics,
        }
    }

    pub async fn process(&self, delivery: Box<dyn Delivery>) -> Settlement {
        let queue = delivery.queue().to_string();
        let attempt = delivery.attempt();

        let task = match TaskEnvelope::from_bytes(delivery.body()) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(%queue, attempt, error = %e, "malformed task body, dead-lettering");
                let reason = format!("malformed task: {e}");
                log_settle_error(&queue, delivery.dead_letter(reason.clone()).await);
                self.metrics.record_dead_lettered();
                return Settlement::DeadLettered { reason };
            }
        };

        let dataset = task.collection_id().as_str();
        let task_id = task.task_id();
        if let Err(e) = self
            .ledger
            .checkout_task(dataset, task_id, task.operation())
            .await
        {
            tracing::warn!(%task_id, error = %e, "could not check out task");
        }

        let error = match self.router.dispatch(&task).await {
            Ok(_) => {
                log_settle_error(&queue, delivery.ack().await);
                if let Err(e) = self.ledger.mark_done(dataset, task_id).await {
                    tracing::warn!(%task_id, error = %e, "could not mark task done");
                }
                return Settlement::Acked;
            }
            Err(error) => error,
        };

        match self.decider.decide(attempt, &error) {
            Decision::Retry { delay, reason } => {
                tracing::warn!(%queue, %task_id, attempt, ?delay, %reason, "requeueing task");
                // Back to pending before the broker can redeliver it.
                if let Err(e) = self.ledger.add_task(dataset, task_id, task.operation()).await {
                    tracing::warn!(%task_id, error = %e, "could not mark task pending");
                }
                log_settle_error(&queue, delivery.requeue(delay).await);
                self.metrics.record_retried();
                Settlement::Requeued { delay }
            }
            Decision::MarkDead { reason } => {
                tracing::error!(%queue, %task_id, attempt, %reason, "dead-lettering task");
                log_settle_error(&queue, delivery.dead_letter(reason.clone()).await);
                self.metrics.record_dead_lettered();
                if let Err(e) = self.ledger.mark_failed(dataset, task_id).await {
                    tracing::warn!(%task_id, error = %e, "could not mark task failed");
                }
                Settlement::DeadLettered { reason }
            }
        }
    }
}

fn log_settle_error(queue: &str, result: Result<(), BrokerError>) {
    if let Err(e) = result {
        tracing::error!(queue, error = %e, "failed to settle delivery");
    }
}

/// Worker group handle.
/// - `request_shutdown()` で全ワーカーが新しい delivery を取らなくなる
/// - `shutdown_and_join()` は実行中のタスクの完了も待つ
/// - consumer は stage ごとに 1 つ。prefetch がその stage 全体の未 ack 数の上限になる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    workers: usize,
    joins: Vec<JoinHandle<()>>,
}

type SharedDeliveries = Arc<Mutex<mpsc::Receiver<Box<dyn Delivery>>>>;

impl WorkerGroup {
    /// Opens one consumer per `(stage, prefetch)` entry and spawns `threads`
    /// workers fed from it.
    pub async fn spawn(
        broker: Arc<dyn Broker>,
        worker: Arc<Worker>,
        plan: &[(Stage, u16)],
        threads: usize,
    ) -> Result<Self, BrokerError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(plan.len() * (threads + 1));
        for &(stage, prefetch) in plan {
            let consumer = broker.consume(stage.queue_name(), prefetch).await?;
            let (tx, rx) = mpsc::channel(1);
            let deliveries: SharedDeliveries = Arc::new(Mutex::new(rx));
            tracing::debug!(%stage, prefetch, threads, "starting stage consumer");

            joins.push(tokio::spawn(feed_loop(
                stage,
                consumer,
                tx,
                shutdown_rx.clone(),
            )));
            for index in 0..threads {
                let name = format!("{stage}-{index}");
                joins.push(tokio::spawn(worker_loop(
                    name,
                    Arc::clone(&deliveries),
                    Arc::clone(&worker),
                    shutdown_rx.clone(),
                )));
            }
        }

        Ok(Self {
            shutdown_tx,
            workers: plan.len() * threads,
            joins,
        })
    }

    /// Number of workers across all stages.
    pub fn len(&self) -> usize {
        self.workers
    }

    pub fn is_empty(&self) -> bool {
        self.workers == 0
    }

    /// Request shutdown for all workers.
    /// In-flight handlers are not cancelled; workers stop taking new
    /// deliveries.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
    }
}

/// Moves deliveries from the stage consumer to its workers. A delivery that
/// never reaches a worker is dropped, which puts it back on the queue.
async fn feed_loop(
    stage: Stage,
    mut consumer: Box<dyn Consumer>,
    tx: mpsc::Sender<Box<dyn Delivery>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let delivery = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            delivery = consumer.next() => delivery,
        };
        let Some(delivery) = delivery else {
            tracing::debug!(%stage, "consumer closed");
            break;
        };

        let sent = tokio::select! {
            _ = stopped(&mut shutdown_rx) => false,
            sent = tx.send(delivery) => sent.is_ok(),
        };
        if !sent {
            break;
        }
    }
    tracing::debug!(%stage, "stage consumer stopped");
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    // An error means the group handle is gone, which also means stop.
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn next_delivery(
    deliveries: &Mutex<mpsc::Receiver<Box<dyn Delivery>>>,
) -> Option<Box<dyn Delivery>> {
    deliveries.lock().await.recv().await
}

async fn worker_loop(
    name: String,
    deliveries: SharedDeliveries,
    worker: Arc<Worker>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Waiting for a delivery races the shutdown signal.
        let delivery = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            delivery = next_delivery(&deliveries) => delivery,
        };

        let Some(delivery) = delivery else {
            break;
        };

        worker.process(delivery).await;
    }
    tracing::debug!(worker = %name, "worker stopped");
}
