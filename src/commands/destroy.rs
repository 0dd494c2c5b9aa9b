//! `stackplan destroy`

use anyhow::Result;
use stackgraph::{Environment, ExecuteOptions, RemoteStateBridge};

use super::{Sources, compile, load_project, print_summary, state_store, was_declined};
use crate::Context;
use crate::backend::SimulatedBackend;
use crate::cli::DestroyArgs;
use crate::progress::{BatchProgress, PromptConfirm};
use crate::ui;

pub fn run(ctx: &Context, args: &DestroyArgs) -> Result<()> {
    let project = load_project(ctx)?;
    let sources = Sources::new(&project, &args.vars)?;
    let store = state_store(&project);
    let bridge = RemoteStateBridge::new(&store);

    let compiled = compile(&project, &args.stacks, &sources, &bridge)?;

    let backend = SimulatedBackend::new();
    let env = Environment {
        backend: &backend,
        store: &store,
        bridge: &bridge,
    };
    let opts = ExecuteOptions {
        jobs: usize::from(args.jobs),
        prune: true,
    };
    let mut progress = BatchProgress::new(ctx.verbose, ctx.quiet);
    let mut confirm = PromptConfirm::new(args.yes);

    match stackgraph::destroy(&compiled, &env, &opts, &mut progress, &mut confirm) {
        Ok(summary) if was_declined(&summary) => {
            ui::warn("Cancelled");
            Ok(())
        }
        Ok(summary) => {
            if !ctx.quiet {
                print_summary(&summary);
            }
            let names: Vec<&str> = compiled.stacks().iter().map(|s| s.name.as_str()).collect();
            ui::success(&format!("Destroyed {}", names.join(", ")));
            Ok(())
        }
        Err(failure) => {
            print_summary(&failure.summary);
            ui::dim(failure.error.category().advice());
            Err(anyhow::Error::new(failure).context("Destroy stopped before completion"))
        }
    }
}
