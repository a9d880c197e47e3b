use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use flow_service::{FlowParser, FlowValidator};

/// Validate a flow definition file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the flow YAML or JSON file
    pub flow: PathBuf,

    /// Skip printing the dependency edges and parallel levels
    #[arg(long)]
    pub quiet: bool,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let flow_path = &args.flow;

    if !flow_path.exists() {
        color_eyre::eyre::bail!("Flow file not found: {}", flow_path.display());
    }

    // Step 1: Parse and migrate
    output::status("Validating", &format!("{}", flow_path.display()));

    let flow = match FlowParser::parse_file(flow_path) {
        Ok(f) => f,
        Err(e) => {
            output::error(&format!("Parse error: {}", e.message));
            if e.line > 0 {
                output::dim(&e.context);
            }
            if let Some(suggestion) = &e.suggestion {
                output::info(&format!("  Suggestion: {}", suggestion));
            }
            std::process::exit(1);
        }
    };

    output::check(&format!(
        "Parsed '{}' version '{}' (schema {})",
        flow.name, flow.version, flow.schema
    ));

    let static_count: usize = flow.models.iter().map(|m| m.static_ports.len()).sum();
    output::check(&format!(
        "Structure: {} models, {} logical ports, {} static mounts",
        flow.models.len(),
        flow.input_port_names()
            .union(&flow.output_port_names())
            .count(),
        static_count
    ));

    // Step 2: Structural rules
    let validated = match FlowValidator::validate(flow) {
        Ok(v) => v,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    output::check("Dependency graph is a valid DAG");

    // Step 3: Plan
    if !args.quiet {
        let flow = validated.flow();
        let graph = validated.graph();
        let name = |i: usize| flow.model(i).map(|m| m.name.as_str()).unwrap_or("?");

        println!();
        output::header("Edges");
        if graph.edges().is_empty() {
            output::dim("  (none)");
        }
        for edge in graph.edges() {
            println!(
                "  {} -> {}  via '{}'",
                name(edge.producer),
                name(edge.consumer),
                edge.port
            );
        }

        output::header("Parallel levels");
        for (level, indices) in graph.parallel_levels().iter().enumerate() {
            let models: Vec<String> = indices
                .iter()
                .map(|&i| {
                    let Some(model) = flow.model(i) else {
                        return "?".to_string();
                    };
                    // Only models reading nothing but src run at the declared priority
                    let priority = if model.reads_only_source() {
                        format!("priority {}", flow.priority)
                    } else {
                        "reschedule priority".to_string()
                    };
                    let gpu = if model.gpu { ", gpu" } else { "" };
                    format!("{} ({}{})", model.name, priority, gpu)
                })
                .collect();
            println!("  {}: {}", level, models.join(", "));
        }
    }

    println!();
    output::success("Flow is valid");

    Ok(())
}
