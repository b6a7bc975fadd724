//! Email delivery demo for the workqueue library.
//!
//! Enqueues a handful of emails, some of which hit a flaky SMTP server, and
//! lets a runner work through them with retries. A throwaway PostgreSQL is
//! started with TestContainers, so no setup is needed:
//!
//! ```bash
//! RUST_LOG=info cargo run --example emails
//! ```

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workqueue::{BackgroundJob, JobStatus, RetryPolicy, Runner, count_by_status, setup_database};

#[derive(Clone, Default)]
struct Smtp {
    attempts: Arc<AtomicUsize>,
}

#[derive(Serialize, Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

#[derive(Serialize)]
struct Receipt {
    message_id: String,
}

impl BackgroundJob for SendEmail {
    const JOB_TYPE: &'static str = "send_email";
    const QUEUE: &'static str = "emails";
    const MAX_RETRIES: i32 = 2;
    type Context = Smtp;
    type Output = Receipt;

    async fn run(&self, smtp: Self::Context) -> Result<Receipt> {
        let attempt = smtp.attempts.fetch_add(1, Ordering::SeqCst);
        if self.to.ends_with("@flaky.example") && attempt % 2 == 0 {
            bail!("smtp timeout");
        }
        if self.to.ends_with("@down.example") {
            bail!("connection refused");
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        info!(to = %self.to, subject = %self.subject, "Email sent");
        Ok(Receipt {
            message_id: format!("<{attempt}@mail.example>"),
        })
    }
}

async fn start_database() -> Result<(PgPool, ContainerAsync<Postgres>)> {
    info!("Starting PostgreSQL container...");
    let container = Postgres::default().start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    let pool = PgPool::connect(&connection_string).await?;
    setup_database(&pool).await?;

    Ok((pool, container))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,emails=info,workqueue=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();

    let (pool, _container) = start_database().await?;

    let recipients = [
        "ada@example.com",
        "grace@flaky.example",
        "linus@example.com",
        "ken@down.example",
    ];
    for to in recipients {
        let email = SendEmail {
            to: to.to_string(),
            subject: "Welcome aboard".to_string(),
        };
        email.enqueue(&pool).await?;
    }
    info!("Enqueued {} emails", recipients.len());

    let runner = Runner::new(pool.clone(), Smtp::default())
        .register::<SendEmail>()
        .configure_queue(SendEmail::QUEUE, |queue| {
            queue
                .num_workers(2)
                .poll_interval(Duration::from_millis(100))
                .max_poll_interval(Duration::from_secs(1))
                .lease_duration(Duration::from_secs(30))
                .retry_policy(RetryPolicy::new(
                    Duration::from_millis(200),
                    Duration::from_secs(2),
                ))
        });

    let handle = runner.start();
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let pending = count_by_status(&pool, SendEmail::QUEUE, JobStatus::Pending).await?;
        let processing = count_by_status(&pool, SendEmail::QUEUE, JobStatus::Processing).await?;
        if pending == 0 && processing == 0 {
            break;
        }
    }
    handle.abort();

    let completed = count_by_status(&pool, SendEmail::QUEUE, JobStatus::Completed).await?;
    let failed = count_by_status(&pool, SendEmail::QUEUE, JobStatus::Failed).await?;
    info!(completed, failed, "All emails processed");

    Ok(())
}
