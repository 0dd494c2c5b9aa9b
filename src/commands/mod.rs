// Project commands
pub mod apply;
pub mod destroy;
pub mod graph;
pub mod outputs;
pub mod plan;
pub mod validate;

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use stackgraph::{
    CompiledPlan, Compiler, EnvSource, ExecuteSummary, LocalStateStore, MapSource,
    RemoteStateBridge, VariableSource,
};

use crate::Context;
use crate::cli::VarArgs;
use crate::config::{self, Project};
use crate::progress;
use crate::ui;

/// Load the project file named on the command line
pub fn load_project(ctx: &Context) -> Result<Project> {
    let mut project = Project::load(&ctx.project)?;
    if let Some(dir) = &ctx.state_dir {
        project.state_dir = dir.clone();
    }
    log::info!("state directory: {}", project.state_dir.display());
    Ok(project)
}

pub fn state_store(project: &Project) -> LocalStateStore {
    LocalStateStore::new(&project.state_dir)
}

/// Variable sources in binding order: flags, var file, environment
pub struct Sources {
    flags: MapSource,
    file: Option<MapSource>,
    env: EnvSource,
}

impl Sources {
    pub fn new(project: &Project, args: &VarArgs) -> Result<Self> {
        Ok(Self {
            flags: config::var_flags(&args.vars)?,
            file: args.var_file.as_deref().map(config::var_file).transpose()?,
            env: EnvSource::new(&project.env_prefix),
        })
    }

    pub fn chain(&self) -> Vec<&dyn VariableSource> {
        let mut chain: Vec<&dyn VariableSource> = vec![&self.flags];
        if let Some(file) = &self.file {
            chain.push(file);
        }
        chain.push(&self.env);
        chain
    }
}

/// Compile `stacks` of the project (all of them when empty)
pub fn compile(
    project: &Project,
    stacks: &[String],
    sources: &Sources,
    bridge: &RemoteStateBridge<'_>,
) -> Result<CompiledPlan> {
    let registry = project.registry();
    let pb = progress::spinner(&format!("Compiling {}", project.path.display()));
    let result =
        Compiler::new(registry.as_ref()).compile(&project.stacks, stacks, &sources.chain(), bridge);
    match &result {
        Ok(_) => pb.finish_and_clear(),
        Err(e) => {
            progress::finish_error(&pb, e.category().description());
            ui::dim(e.category().advice());
        }
    }
    result.with_context(|| format!("Failed to compile {}", project.path.display()))
}

/// Print batches, optionally with each node's previewed configuration
pub fn print_plan(
    compiled: &CompiledPlan,
    bridge: &RemoteStateBridge<'_>,
    show_config: bool,
) -> Result<()> {
    let plan = compiled.plan();
    let names: Vec<&str> = compiled.stacks().iter().map(|s| s.name.as_str()).collect();

    ui::header(&format!("Plan: {}", names.join(", ")));
    ui::kv(
        "Nodes",
        &format!(
            "{} in {}",
            plan.node_count(),
            ui::count(plan.batches.len(), "batch")
        ),
    );

    for (index, batch) in plan.batches.iter().enumerate() {
        ui::section(&format!("Batch {}", index + 1));
        for key in &batch.nodes {
            let kind = compiled.node(key).map(|n| n.kind.as_str()).unwrap_or("?");
            let deps = compiled
                .graph()
                .node_index(key)
                .map(|i| compiled.graph().node_dependencies(i))
                .unwrap_or_default();

            println!("  {} {} {}", "+".green(), key.to_string().bold(), kind.dimmed());
            if !deps.is_empty() {
                let deps: Vec<String> = deps.iter().map(ToString::to_string).collect();
                ui::dim(&format!("    after {}", deps.join(", ")));
            }
            if show_config {
                let config = compiled.preview_config(key, bridge)?;
                for line in serde_json::to_string_pretty(&config)?.lines() {
                    ui::dim(&format!("    {line}"));
                }
            }
        }
    }

    for stack in compiled.stacks() {
        let deferred = compiled.deferred_sources(&stack.name);
        if !deferred.is_empty() {
            let deferred: Vec<&str> = deferred.iter().map(String::as_str).collect();
            ui::info(&format!(
                "{} reads {} after its backing stacks are applied",
                stack.name,
                deferred.join(", ")
            ));
        }
    }

    Ok(())
}

/// Print the outcome of apply or destroy
pub fn print_summary(summary: &ExecuteSummary) {
    ui::section("Summary");
    if !summary.applied.is_empty() {
        ui::kv("Applied", &summary.applied.len().to_string());
    }
    if !summary.destroyed.is_empty() {
        ui::kv("Destroyed", &summary.destroyed.len().to_string());
    }
    if !summary.skipped.is_empty() {
        ui::kv("Skipped", &summary.skipped.len().to_string());
    }
    if !summary.persisted.is_empty() {
        ui::kv("State saved", &summary.persisted.join(", "));
    }
    for (key, error) in &summary.failed {
        println!("  {} {} {}", "✗".red(), key.to_string().bold(), error.dimmed());
    }
    if !summary.not_started.is_empty() {
        let keys: Vec<String> = summary.not_started.iter().map(ToString::to_string).collect();
        ui::kv("Not started", &keys.join(", "));
    }
    if summary.total_changes() == 0 && summary.failed.is_empty() && summary.not_started.is_empty() {
        ui::dim("No changes");
    }
}

/// A declined confirmation leaves every node not started and nothing done
pub fn was_declined(summary: &ExecuteSummary) -> bool {
    !summary.not_started.is_empty()
        && summary.batches_completed == 0
        && summary.total_changes() == 0
        && summary.failed.is_empty()
}
