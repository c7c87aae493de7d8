//! Command execution.

use crate::Commands;
use colored::Colorize;
use serde_json::{json, Value};
use std::path::Path;
use tsm_client::Client;
use tsm_protocol::message::{HistoryView, TransitionView};

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            client.ping(json!({})).await?;
            Ok("PONG".green().to_string())
        }

        Commands::Info => {
            let info = client.info().await?;
            Ok(format_json(&serde_json::to_value(&info)?))
        }

        Commands::PutMachine { definition } => {
            let definition = parse_definition_arg(&definition)?;
            let result = client.put_machine(definition).await?;

            let status = if result.created {
                "Created".green()
            } else {
                "Unchanged".yellow()
            };
            Ok(format!(
                "{} machine {} (id: {}, checksum: {})",
                status,
                result.machine.cyan(),
                result.machine_id,
                result.checksum
            ))
        }

        Commands::GetMachine { machine } => {
            let result = client.get_machine(&machine).await?;
            Ok(format!(
                "{}\n{}",
                format!("Machine {} ({})", machine.cyan(), result.checksum).bold(),
                format_json(&result.definition)
            ))
        }

        Commands::ListMachines => {
            let machines = client.list_machines().await?;
            if machines.is_empty() {
                return Ok("No machines registered".yellow().to_string());
            }

            let mut output = String::new();
            for machine in machines {
                if machine.description.is_empty() {
                    output.push_str(&format!("  {}\n", machine.name.cyan()));
                } else {
                    output.push_str(&format!(
                        "  {} - {}\n",
                        machine.name.cyan(),
                        machine.description
                    ));
                }
            }
            Ok(output)
        }

        Commands::ListTransitions { machine } => {
            let transitions = client.list_machine_transitions(&machine).await?;
            Ok(format_transitions(&transitions))
        }

        Commands::Initiate { key, by } => {
            let instance = client.initiate_instance(&key.key(), &by).await?;
            Ok(format!(
                "{} instance {}\n  Machine: {}\n  State: {}",
                "Initiated".green(),
                format!("{}/{}", instance.external_name, instance.external_id).cyan(),
                instance.machine,
                instance.state.yellow()
            ))
        }

        Commands::Get { key } => {
            let instance = client.get_instance(&key.key()).await?;
            Ok(format!(
                "{}\n  Id: {}\n  Machine: {}\n  State: {}\n  Initiated by: {}\n  Created: {}",
                format!(
                    "Instance {}",
                    format!("{}/{}", instance.external_name, instance.external_id).cyan()
                )
                .bold(),
                instance.id,
                instance.machine,
                instance.state.yellow(),
                instance.initiated_by,
                instance.created_at.to_rfc3339()
            ))
        }

        Commands::Delete { key } => {
            client.delete_instance(&key.key()).await?;
            Ok(format!(
                "{} instance {}",
                "Deleted".green(),
                format!("{}/{}", key.external_name, key.external_id).cyan()
            ))
        }

        Commands::Possible { key } => {
            let transitions = client.list_possible_transitions(&key.key()).await?;
            Ok(format_transitions(&transitions))
        }

        Commands::Transition {
            key,
            transition,
            by,
            comment,
        } => {
            let result = client
                .transition_instance(&key.key(), &transition, &by, &comment)
                .await?;
            Ok(format!(
                "{} {} on {}\n  {} → {}",
                "Applied".green(),
                result.transition.cyan(),
                format!("{}/{}", key.external_name, key.external_id),
                result.from_state,
                result.to_state.yellow()
            ))
        }

        Commands::History { key } => {
            let history = client.get_instance_history(&key.key()).await?;
            Ok(format_history(&history.entries))
        }
    }
}

/// Reads a definition argument: inline JSON, or `@path` to a JSON or YAML
/// file.
fn parse_definition_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let Some(path) = arg.strip_prefix('@') else {
        return Ok(serde_json::from_str(arg)?);
    };

    let content = std::fs::read_to_string(path)?;
    let is_yaml = matches!(
        Path::new(path).extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    if is_yaml {
        Ok(serde_yaml::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(&content)?)
    }
}

fn format_transitions(transitions: &[TransitionView]) -> String {
    if transitions.is_empty() {
        return "No transitions".yellow().to_string();
    }

    let mut output = String::new();
    for t in transitions {
        output.push_str(&format!(
            "  {} --{}--> {}",
            t.from_state,
            t.transition_name.cyan(),
            t.to_state
        ));
        if let Some(pre) = &t.pre_task {
            output.push_str(&format!(" [pre: {}]", pre));
        }
        if let Some(post) = &t.post_task {
            output.push_str(&format!(" [post: {}]", post));
        }
        output.push('\n');
    }
    output
}

fn format_history(entries: &[HistoryView]) -> String {
    if entries.is_empty() {
        return "No history".yellow().to_string();
    }

    let mut output = String::new();
    for entry in entries {
        output.push_str(&format!(
            "[{:>6}] {} | {} -> {} by {}\n",
            entry.id.to_string().cyan(),
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            entry.transition_name.yellow(),
            entry.state,
            entry.made_by
        ));
        if !entry.comment.is_empty() {
            output.push_str(&format!("         {}\n", entry.comment.dimmed()));
        }
    }
    output
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
