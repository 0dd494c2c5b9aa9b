//! `stackplan outputs`

use anyhow::{Context as AnyhowContext, Result, bail};
use colored::Colorize;
use stackgraph::{OutputValue, REDACTED, StackState, StateReader};

use super::{load_project, state_store};
use crate::Context;
use crate::ui;

pub fn run(ctx: &Context, stack: &str, json: bool) -> Result<()> {
    let project = load_project(ctx)?;
    if !project.stacks.iter().any(|s| s.name == stack) {
        ui::warn(&format!(
            "Stack '{}' is not declared in {} (declared: {})",
            stack,
            project.path.display(),
            project.stack_names().join(", ")
        ));
    }

    let store = state_store(&project);
    let Some(state) = store
        .read(stack)
        .with_context(|| format!("Could not read state of stack '{stack}'"))?
    else {
        bail!("Stack '{stack}' has not been applied");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&masked(&state))?);
        return Ok(());
    }

    ui::header(&format!("Outputs: {stack}"));
    ui::kv("Serial", &state.serial.to_string());
    ui::kv(
        "Applied",
        &state
            .applied_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    );
    ui::kv("Nodes", &state.nodes.len().to_string());

    if state.outputs.is_empty() {
        ui::dim("(no outputs)");
        return Ok(());
    }

    println!();
    for (name, value) in &state.outputs {
        let rendered = if state.sensitive_outputs.contains(name) {
            REDACTED.dimmed().to_string()
        } else {
            match value {
                OutputValue::String(s) => s.clone(),
                OutputValue::List(items) => format!("[{}]", items.join(", ")),
            }
        };
        println!("  {} = {}", name.bold(), rendered);
    }
    Ok(())
}

/// Outputs as JSON with sensitive values replaced
fn masked(state: &StackState) -> serde_json::Value {
    state
        .outputs
        .iter()
        .map(|(name, value)| {
            let value = if state.sensitive_outputs.contains(name) {
                serde_json::Value::String(REDACTED.to_string())
            } else {
                value.to_json()
            };
            (name.clone(), value)
        })
        .collect::<serde_json::Map<_, _>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_outputs_are_masked() {
        let mut state = StackState::next("cluster", None);
        state
            .outputs
            .insert("endpoint".into(), OutputValue::String("https://eks.local".into()));
        state
            .outputs
            .insert("token".into(), OutputValue::String("s3cr3t-token".into()));
        state.outputs.insert(
            "subnet_ids".into(),
            OutputValue::List(vec!["subnet-a".into(), "subnet-b".into()]),
        );
        state.sensitive_outputs.insert("token".into());

        let json = masked(&state);
        assert_eq!(json["endpoint"], "https://eks.local");
        assert_eq!(json["token"], REDACTED);
        assert_eq!(json["subnet_ids"], serde_json::json!(["subnet-a", "subnet-b"]));
        assert!(!json.to_string().contains("s3cr3t-token"));
    }
}
