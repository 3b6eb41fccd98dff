//! Drains a handful of jobs with mixed outcomes and prints the events.
//!
//! ```bash
//! RUST_LOG=durable_queue=debug cargo run --example drain
//! ```

use anyhow::Result;
use durable_queue::{Job, JobHandler, JobOutcome, Queue, QueueConfig, QueueEvent, async_trait};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Payload of the `resize` task
#[derive(Serialize, Deserialize)]
struct Resize {
    image: String,
    width: u32,
}

/// Fails every image whose name starts with `broken`, and gives up on the
/// whole queue if it is asked to resize to zero width.
struct ImageHandler;

#[async_trait]
impl JobHandler for ImageHandler {
    async fn process(&self, job: &Job) -> JobOutcome {
        let Ok(resize) = job.payload::<Resize>() else {
            return JobOutcome::CriticalFail;
        };

        tokio::time::sleep(Duration::from_millis(50)).await;

        if resize.width == 0 {
            JobOutcome::CriticalFail
        } else if resize.image.starts_with("broken") {
            JobOutcome::Fail
        } else {
            println!("Resized {} to {}px", resize.image, resize.width);
            JobOutcome::Success
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dir = tempfile::tempdir()?;
    let config = QueueConfig::from_env()
        .with_database_path(dir.path().join("demo.sqlite"))
        .with_retry_limit(2);

    let queue = Queue::connect(config, ImageHandler).await?;
    let mut events = queue.subscribe();

    for (image, width, priority) in [
        ("banner.png", 1200, 1),
        ("avatar.png", 64, 0),
        ("broken.png", 300, 2),
        ("thumb.png", 128, 0),
    ] {
        let resize = Resize {
            image: image.into(),
            width,
        };
        queue.enqueue_with_priority(&resize, "resize", priority).await?;
    }

    queue.start();

    while let Ok(event) = events.recv().await {
        match event {
            QueueEvent::JobSucceeded(job) => println!("job {} succeeded", job.id),
            QueueEvent::JobFailed(job) => {
                println!("job {} failed (attempt {})", job.id, job.attempts);
            }
            QueueEvent::QueueDrained | QueueEvent::QueueStopped => break,
            QueueEvent::QueueStarted => println!("queue started"),
        }
    }

    queue.shutdown().await;
    Ok(())
}
