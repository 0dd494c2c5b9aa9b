//! `stackplan plan`

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use stackgraph::{PlanArtifact, PlanDiff, RemoteStateBridge};
use std::fs;
use std::path::Path;

use super::{Sources, compile, load_project, print_plan, state_store};
use crate::Context;
use crate::cli::PlanArgs;
use crate::ui;

pub fn run(ctx: &Context, args: &PlanArgs) -> Result<()> {
    let project = load_project(ctx)?;
    let sources = Sources::new(&project, &args.vars)?;
    let store = state_store(&project);
    let bridge = RemoteStateBridge::new(&store);

    let compiled = compile(&project, &args.stacks, &sources, &bridge)?;
    if !ctx.quiet {
        print_plan(&compiled, &bridge, true)?;
    }

    let artifact = compiled.artifact();

    if let Some(previous) = &args.diff {
        let old = load_artifact(previous)?;
        show_diff(&PlanDiff::between(&old, &artifact));
    }

    if let Some(out) = &args.out {
        fs::write(out, artifact.to_json()?)
            .with_context(|| format!("Could not write plan to {}", out.display()))?;
        ui::success(&format!("Plan written to {}", out.display()));
    }

    Ok(())
}

fn load_artifact(path: &Path) -> Result<PlanArtifact> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read plan {}", path.display()))?;
    let artifact = PlanArtifact::from_json(&content)
        .with_context(|| format!("Invalid plan artifact {}", path.display()))?;
    if !artifact.is_intact() {
        ui::warn(&format!(
            "{} was modified after it was written (fingerprint mismatch)",
            path.display()
        ));
    }
    Ok(artifact)
}

fn show_diff(diff: &PlanDiff) {
    ui::section("Changes since previous plan");
    if diff.is_empty() {
        ui::dim("(no changes)");
        return;
    }

    for address in &diff.added {
        println!("  {} {}", "+".green(), address);
    }
    for address in &diff.removed {
        println!("  {} {}", "-".red(), address);
    }
    for moved in &diff.moved {
        println!(
            "  {} {} {}",
            ">".yellow(),
            moved.address,
            format!("(batch {} -> {})", moved.from + 1, moved.to + 1).dimmed()
        );
    }
    for changed in &diff.changed {
        println!("  {} {}", "~".yellow(), changed.address);
        show_text_diff(&changed.before, &changed.after);
    }

    println!();
    ui::kv("Summary", &diff.summary());
}

/// Line diff of two pretty-printed JSON values using the `similar` crate
fn show_text_diff(before: &serde_json::Value, after: &serde_json::Value) {
    let (Ok(text_a), Ok(text_b)) = (
        serde_json::to_string_pretty(before),
        serde_json::to_string_pretty(after),
    ) else {
        return;
    };

    let diff = similar::TextDiff::from_lines(&text_a, &text_b);
    for change in diff.iter_all_changes() {
        let line = change.value().trim_end_matches('\n');
        match change.tag() {
            similar::ChangeTag::Delete => println!("    {}", format!("- {line}").red()),
            similar::ChangeTag::Insert => println!("    {}", format!("+ {line}").green()),
            similar::ChangeTag::Equal => {}
        }
    }
}
