//! taskline CLI: run the pipeline, publish task events, inspect tasks.

use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use taskline::bus::{MessageBus, OutboundMessage, PgmqBus};
use taskline::config::Config;
use taskline::config::secrets::{ExposeSecret, redacted_url};
use taskline::db::Db;
use taskline::model::{TaskId, TaskStatus};
use taskline::pipeline;
use taskline::store::TaskStore;
use taskline::telemetry::propagation::TraceContext;
use taskline::telemetry::{TelemetryConfig, init_telemetry};
use taskline::validation::{
    Headers, STATUS_HEADER, TASK_ID_HEADER, TIMESTAMP_HEADER, TRACEPARENT_HEADER,
    TRACESTATE_HEADER,
};

#[derive(Parser)]
#[command(name = "taskline", about = "Task lifecycle event pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the partition consumers until Ctrl-C
    Serve,
    /// Publish a task event to the inbound topic
    Publish {
        #[command(subcommand)]
        event: PublishEvent,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Args)]
struct PayloadArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    query: String,
    #[arg(long)]
    url: String,
    /// W3C traceparent to continue; a fresh trace is started otherwise
    #[arg(long)]
    traceparent: Option<String>,
    #[arg(long)]
    tracestate: Option<String>,
}

#[derive(Subcommand)]
enum PublishEvent {
    /// Request a new task
    New {
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Report a finished crawl
    Complete {
        task_id: String,
        #[arg(long)]
        result: String,
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Report a failed crawl
    Error {
        task_id: String,
        #[arg(long)]
        message: String,
        #[command(flatten)]
        payload: PayloadArgs,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Show a task
    Show {
        /// Task ID (full UUID)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Publish { event } => {
            let db = connect(&config).await?;
            cmd_publish(db, &config, event).await
        }
        Command::Task {
            action: TaskAction::Show { id },
        } => {
            let db = connect(&config).await?;
            cmd_task_show(&db, &id).await
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    tracing::info!(url = %redacted_url(&config.database_url), "connecting to database");
    let db = Db::connect(config.database_url.expose_secret(), config.max_connections).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "taskline".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = connect(&config).await?;
    let pipeline_config = &config.pipeline;
    let bus = PgmqBus::new(
        db.clone(),
        pipeline_config.partitions,
        pipeline_config.visibility_timeout,
    );
    bus.ensure_topic(&pipeline_config.outbound_topic).await?;

    let consumer = pipeline::build(Arc::new(db), Arc::new(bus), pipeline_config);

    let stop = consumer.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stop.shutdown();
    });

    consumer.run().await?;
    Ok(())
}

async fn cmd_publish(db: Db, config: &Config, event: PublishEvent) -> anyhow::Result<()> {
    let (status, task_id, payload, extra) = match event {
        PublishEvent::New { payload } => (TaskStatus::New, None, payload, None),
        PublishEvent::Complete {
            task_id,
            result,
            payload,
        } => (
            TaskStatus::Completed,
            Some(task_id),
            payload,
            Some(("crawl_result", result)),
        ),
        PublishEvent::Error {
            task_id,
            message,
            payload,
        } => (
            TaskStatus::Error,
            Some(task_id),
            payload,
            Some(("error_message", message)),
        ),
    };

    let mut headers = Headers::new();
    headers.insert(STATUS_HEADER.to_string(), status.to_string());
    headers.insert(TIMESTAMP_HEADER.to_string(), Utc::now().to_rfc3339());
    if let Some(id) = &task_id {
        headers.insert(TASK_ID_HEADER.to_string(), id.clone());
    }
    let traceparent = payload
        .traceparent
        .unwrap_or_else(|| TraceContext::new_root().traceparent());
    headers.insert(TRACEPARENT_HEADER.to_string(), traceparent);
    if let Some(tracestate) = payload.tracestate {
        headers.insert(TRACESTATE_HEADER.to_string(), tracestate);
    }

    let mut body = json!({
        "user_email": payload.email,
        "user_query": payload.query,
        "base_url": payload.url,
    });
    if let Some((field, value)) = extra {
        body[field] = json!(value);
    }

    let pipeline_config = &config.pipeline;
    let bus = PgmqBus::new(
        db,
        pipeline_config.partitions,
        pipeline_config.visibility_timeout,
    );
    bus.ensure_topic(&pipeline_config.inbound_topic).await?;
    let msg_id = bus
        .produce(
            &pipeline_config.inbound_topic,
            OutboundMessage {
                key: task_id,
                headers,
                body: body.to_string(),
            },
        )
        .await?;

    println!("Published {status} event (msg {msg_id})");
    Ok(())
}

async fn cmd_task_show(db: &Db, id: &str) -> anyhow::Result<()> {
    let id: TaskId = id.parse()?;
    let Some(task) = db.get(id).await? else {
        anyhow::bail!("no task {id}");
    };

    println!("ID:         {}", task.id);
    println!("Status:     {}", task.status);
    println!("Email:      {}", task.user_email);
    println!("Query:      {}", task.user_query);
    println!("Base URL:   {}", task.base_url);
    println!("Received:   {}", task.received_at);
    println!("Created:    {}", task.created_at);
    println!("Updated:    {}", task.updated_at);
    if let Some(result) = &task.crawl_result {
        println!("Result:     {result}");
    }
    if let Some(message) = &task.error_message {
        println!("Error:      {message}");
    }
    Ok(())
}
