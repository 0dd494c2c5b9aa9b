//! `stackplan validate`

use anyhow::Result;
use stackgraph::RemoteStateBridge;

use super::{Sources, compile, load_project, state_store};
use crate::Context;
use crate::cli::VarArgs;
use crate::ui;

pub fn run(ctx: &Context, args: &VarArgs) -> Result<()> {
    let project = load_project(ctx)?;
    let sources = Sources::new(&project, args)?;
    let store = state_store(&project);
    let bridge = RemoteStateBridge::new(&store);

    let compiled = compile(&project, &[], &sources, &bridge)?;

    if !ctx.quiet {
        let graph = compiled.graph();
        ui::success(&format!(
            "{} is valid: {}, {}, {}, {}",
            project.path.display(),
            ui::count(compiled.stacks().len(), "stack"),
            ui::count(compiled.plan().node_count(), "node"),
            ui::count(graph.edge_count(), "edge"),
            ui::count(compiled.plan().batches.len(), "batch")
        ));
        if ctx.verbose > 0 {
            for stack in compiled.stacks() {
                ui::kv(&stack.name, &ui::count(stack.nodes.len(), "node"));
            }
        }
    }
    Ok(())
}
