// Measurement probe: wires a publish controller and a consumption loop over
// the loopback transport in one process and reports the delivery summary.
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pulse_client::{
    AdmissionPolicy, ConsumerConfig, ConsumerLoop, LoopbackTransport, OverflowBehavior,
    PublishController, PublishOutcome, Transport,
};
use pulse_stats::{DeliveryStats, Summary};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "probe")]
#[command(about = "Message delivery measurement probe")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Namespace label for the topic path
    #[arg(long, default_value = "local")]
    project_id: String,

    /// Topic name
    #[arg(long, default_value = "pub-sub-task-1")]
    topic_id: String,

    /// Identity stamped into published envelopes
    #[arg(long, default_value = "producer-1")]
    producer_id: String,

    /// Subscription name on the consumer side
    #[arg(long, default_value = "consumer-group-1")]
    subscription_id: String,

    /// Consumer identity for logging
    #[arg(long, default_value = "consumer-1")]
    consumer_id: String,

    /// In-flight publish limit (0 = unbounded)
    #[arg(long, default_value = "1000")]
    message_limit: usize,

    /// Consumer handler concurrency cap (0 = unlimited)
    #[arg(long, default_value = "0")]
    concurrency: usize,

    /// Grace period in milliseconds for in-flight handlers on shutdown
    #[arg(long, default_value = "5000")]
    drain_grace_ms: u64,

    /// Emit the final summary as JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Publish a fixed batch in parallel, wait for delivery, print the audit
    Batch {
        /// Number of messages to publish
        #[arg(long, default_value = "100")]
        num_messages: usize,

        /// Fail attempts over the in-flight limit instead of waiting
        #[arg(long)]
        reject: bool,

        /// Coalesce sends into batches
        #[arg(long)]
        enable_batching: bool,

        /// Batch flush threshold in bytes
        #[arg(long, default_value = "1024")]
        batch_max_bytes: usize,

        /// Batch flush threshold in messages
        #[arg(long, default_value = "10")]
        batch_max_count: usize,

        /// Batch flush age threshold in milliseconds
        #[arg(long, default_value = "100")]
        batch_latency_ms: u64,
    },
    /// Publish continuously until Ctrl-C, then drain and summarize
    Stream {
        /// Seconds between messages
        #[arg(long, default_value = "1.0")]
        publish_interval: f64,
    },
}

impl CommonArgs {
    fn bounded_policy(&self, reject: bool) -> AdmissionPolicy {
        if self.message_limit == 0 {
            AdmissionPolicy::Unbounded
        } else {
            AdmissionPolicy::Bounded {
                max_in_flight: self.message_limit,
                on_exceed: if reject {
                    OverflowBehavior::Reject
                } else {
                    OverflowBehavior::Block
                },
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let topic = format!("{}/{}", cli.common.project_id, cli.common.topic_id);

    let transport = Arc::new(LoopbackTransport::new());
    let subscription = transport.subscribe(&topic);

    let consumer = Arc::new(ConsumerLoop::new(ConsumerConfig {
        max_concurrency: (cli.common.concurrency > 0).then_some(cli.common.concurrency),
        drain_grace: Some(Duration::from_millis(cli.common.drain_grace_ms)),
        per_message_delay: None,
    }));
    let stats = consumer.stats();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let consumer_task = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.run(subscription, cancel_rx).await })
    };
    info!(
        consumer = %cli.common.consumer_id,
        subscription = %cli.common.subscription_id,
        topic = %topic,
        "consumer listening"
    );

    match cli.mode {
        Mode::Batch {
            num_messages,
            reject,
            enable_batching,
            batch_max_bytes,
            batch_max_count,
            batch_latency_ms,
        } => {
            let policy = if enable_batching {
                AdmissionPolicy::Batched {
                    max_batch_bytes: batch_max_bytes,
                    max_batch_count: batch_max_count,
                    max_batch_latency: Duration::from_millis(batch_latency_ms),
                }
            } else {
                cli.common.bounded_policy(reject)
            };
            let controller = PublishController::new(
                Arc::clone(&transport) as Arc<dyn Transport>,
                &topic,
                &cli.common.producer_id,
                policy,
            );

            info!(
                producer = %cli.common.producer_id,
                count = num_messages,
                message_limit = cli.common.message_limit,
                "publishing batch"
            );
            let result = controller.publish_batch(num_messages).await;
            for (i, outcome) in result.outcomes.iter().enumerate() {
                match outcome {
                    PublishOutcome::Delivered { id } => {
                        info!(message = i + 1, id, "published");
                    }
                    PublishOutcome::Failed { cause } => {
                        warn!(message = i + 1, error = %cause, "publish failed");
                    }
                }
            }
            info!(
                succeeded = result.succeeded,
                attempted = result.attempted,
                "batch complete"
            );

            wait_for_received(&stats, result.succeeded as u64).await;
            let summary = finish(cancel_tx, consumer_task).await?;
            report(&summary, cli.common.json)?;
        }
        Mode::Stream { publish_interval } => {
            let controller = PublishController::new(
                Arc::clone(&transport) as Arc<dyn Transport>,
                &topic,
                &cli.common.producer_id,
                cli.common.bounded_policy(false),
            );
            let interval = Duration::from_secs_f64(publish_interval.max(0.0));
            info!(
                producer = %cli.common.producer_id,
                interval_ms = interval.as_millis() as u64,
                "streaming until Ctrl-C"
            );

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    _ = tokio::time::sleep(interval) => {
                        match controller.publish_one().await {
                            PublishOutcome::Delivered { id } => info!(id, "published"),
                            PublishOutcome::Failed { cause } => {
                                warn!(error = %cause, "publish failed");
                            }
                        }
                    }
                }
            }
            info!("interrupt received, draining");
            let summary = finish(cancel_tx, consumer_task).await?;
            report(&summary, cli.common.json)?;
        }
    }

    Ok(())
}

// Bounded wait for the consumer side to catch up with delivered messages.
async fn wait_for_received(stats: &DeliveryStats, expected: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while stats.summary().received < expected {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                expected,
                received = stats.summary().received,
                "not all published messages were received in time"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn finish(
    cancel_tx: watch::Sender<bool>,
    consumer_task: JoinHandle<Summary>,
) -> Result<Summary> {
    let _ = cancel_tx.send(true);
    consumer_task.await.context("consumer task failed")
}

fn report(summary: &Summary, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("serializing summary")?
        );
    } else {
        println!("{summary}");
    }
    Ok(())
}
