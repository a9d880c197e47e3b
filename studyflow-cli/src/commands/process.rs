use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use flow_service::scheduler::progress_channel;
use flow_service::{
    Delivery, InboundMessage, JobStatus, JsonLinesBroker, Scheduler, SchedulerEvent,
    SchedulerService, SqliteStore, Store,
};

/// Feed broker messages through the scheduler
///
/// Reads one JSON envelope per line: {"exchange", "routing_key", "body"}.
/// Published messages are written to stdout as JSON lines.
#[derive(Args, Debug)]
pub struct ProcessArgs {
    /// Input file of JSON-lines envelopes, or "-" for stdin
    #[arg(long, short = 'i', default_value = "-", value_name = "FILE")]
    pub input: String,

    /// Scheduler database (default: ~/.studyflow/scheduler.db)
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Scheduler config file (YAML)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Continue after a message that would be redelivered
    #[arg(long)]
    pub keep_going: bool,
}

pub async fn execute(args: ProcessArgs) -> Result<()> {
    let config = super::resolve_config(args.config.as_deref(), args.db.clone())?;

    output::status("Opening", &format!("{}", config.database_path.display()));
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.database_path)?);

    let (tx, mut rx) = progress_channel();
    let scheduler = Scheduler::new(store, config).with_progress(tx);
    let service = SchedulerService::new(scheduler, JsonLinesBroker::stdout());

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let resumed = service.start().await?;
    if resumed > 0 {
        output::info(&format!("Resumed {} pending message(s)", resumed));
    }

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if args.input == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(&args.input)
            .await
            .map_err(|e| color_eyre::eyre::eyre!("Failed to open {}: {}", args.input, e))?;
        Box::new(BufReader::new(file))
    };

    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut handled = 0usize;
    let mut dropped = 0usize;
    let mut failed = 0usize;
    let mut published = resumed;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let msg: InboundMessage = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(e) => {
                output::warning(&format!("line {}: not a message envelope: {}", line_no, e));
                dropped += 1;
                continue;
            }
        };

        match service.process(&msg).await {
            Ok(Delivery::Acked { published: n }) => {
                handled += 1;
                published += n;
            }
            Ok(Delivery::Dropped) => dropped += 1,
            Err(e) if args.keep_going => {
                output::error(&format!("line {}: {}", line_no, e));
                failed += 1;
            }
            Err(e) => color_eyre::eyre::bail!("line {}: {}", line_no, e),
        }
    }

    // Dropping the service closes the progress channel
    drop(service);
    printer.await?;

    eprintln!();
    output::header(&format!(
        "{} handled, {} dropped, {} failed, {} published",
        handled, dropped, failed, published
    ));

    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::FlowAdmitted {
            flow_instance_id,
            flow_name,
            jobs,
        } => {
            output::status(
                "Admitted",
                &format!("{} ({}, {} jobs)", flow_instance_id, flow_name, jobs),
            );
        }
        SchedulerEvent::FlowDuplicate { flow_instance_id } => {
            output::dim(&format!("             duplicate arrival for {}", flow_instance_id));
        }
        SchedulerEvent::FlowRejected {
            flow_instance_id,
            rule,
            reason,
        } => {
            let rule = rule.map(|r| format!(" (rule {})", r)).unwrap_or_default();
            output::failure(&format!("{} rejected{}: {}", flow_instance_id, rule, reason));
        }
        SchedulerEvent::JobDispatched {
            flow_instance_id,
            job_id,
            model_name,
            queue,
            priority,
        } => {
            output::status(
                "Dispatched",
                &format!(
                    "{} #{} {} -> {} (priority {})",
                    flow_instance_id,
                    job_id,
                    model_name,
                    queue.as_str(),
                    priority
                ),
            );
        }
        SchedulerEvent::JobCompleted {
            flow_instance_id,
            job_id,
            model_name,
            status,
        } => {
            let line = format!("{} #{} {} {}", flow_instance_id, job_id, model_name, status);
            if *status == JobStatus::Success {
                output::success(&line);
            } else {
                output::failure(&line);
            }
        }
        SchedulerEvent::FlowFinished {
            flow_instance_id,
            flow_name,
        } => {
            output::success(&format!("{} finished ({})", flow_instance_id, flow_name));
        }
        SchedulerEvent::MessageIgnored { reason } => {
            output::warning(&format!("ignored: {}", reason));
        }
    }
}
