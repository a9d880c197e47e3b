use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use flow_service::{SqliteStore, Store};

/// Show flow instances stored in the scheduler database
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Show one flow instance with its jobs and mount mapping
    pub flow_id: Option<String>,

    /// Scheduler database (default: ~/.studyflow/scheduler.db)
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Scheduler config file (YAML)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
}

pub fn execute(args: StatusArgs) -> Result<()> {
    let config = super::resolve_config(args.config.as_deref(), args.db)?;

    if !config.database_path.exists() {
        color_eyre::eyre::bail!(
            "No scheduler database at {}",
            config.database_path.display()
        );
    }

    let store = SqliteStore::open(&config.database_path)?;

    match args.flow_id {
        None => list_flows(&store),
        Some(id) => show_flow(&store, &id),
    }
}

fn list_flows(store: &SqliteStore) -> Result<()> {
    let flows = store.list_flows()?;
    if flows.is_empty() {
        output::info("No flow instances");
        return Ok(());
    }

    let pending = flows.iter().filter(|f| !f.status.is_terminal()).count();
    output::header(&format!(
        "{} flow instance(s), {} pending",
        flows.len(),
        pending
    ));
    for flow in flows {
        println!(
            "  {:<36} {:<16} {:<24} {}",
            flow.id, flow.status, flow.flow.name, flow.created_at
        );
    }
    Ok(())
}

fn show_flow(store: &SqliteStore, id: &str) -> Result<()> {
    let flow = store
        .get_flow_by_id(id)?
        .ok_or_else(|| color_eyre::eyre::eyre!("Flow instance not found: {}", id))?;

    output::header(&format!("{} ({})", flow.id, flow.status));
    println!("  flow:     {} version '{}'", flow.flow.name, flow.flow.version);
    println!("  priority: {}", flow.flow.priority);
    println!("  source:   {}", flow.src_uid);
    if let Some(sender) = &flow.sender {
        println!("  sender:   {}", sender);
    }
    println!("  created:  {}", flow.created_at);
    println!("  updated:  {}", flow.updated_at);

    println!();
    let jobs = store.jobs_for_flow(&flow.id)?;
    let settled = jobs.iter().filter(|j| j.status.is_terminal()).count();
    output::header(&format!("Jobs ({}/{} settled)", settled, jobs.len()));
    for job in jobs {
        println!(
            "  [{}] {:<24} {:<10} priority {} attempts {}{}",
            job.model_index,
            job.model_name,
            job.status,
            job.priority,
            job.retries,
            if job.gpu { " gpu" } else { "" }
        );
    }

    println!();
    output::header("Mount mapping");
    for (port, blob_uid) in store.mount_mapping(&flow.id)? {
        println!("  {:<16} {}", port, blob_uid);
    }

    Ok(())
}
