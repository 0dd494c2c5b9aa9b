//! `stackplan apply`

use anyhow::Result;
use stackgraph::{Environment, ExecuteOptions, RemoteStateBridge};

use super::{Sources, compile, load_project, print_plan, print_summary, state_store, was_declined};
use crate::Context;
use crate::backend::SimulatedBackend;
use crate::cli::ApplyArgs;
use crate::progress::{BatchProgress, PromptConfirm};
use crate::ui;

pub fn run(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    let project = load_project(ctx)?;
    let sources = Sources::new(&project, &args.vars)?;
    let store = state_store(&project);
    let bridge = RemoteStateBridge::new(&store);

    let compiled = compile(&project, &args.stacks, &sources, &bridge)?;

    if args.dry_run {
        print_plan(&compiled, &bridge, true)?;
        println!();
        ui::info("Dry run: nothing was applied");
        return Ok(());
    }
    if !ctx.quiet {
        print_plan(&compiled, &bridge, ctx.verbose > 0)?;
        println!();
    }

    let backend = args
        .simulate_failure
        .iter()
        .fold(SimulatedBackend::new(), |backend, address| backend.failing(address.as_str()));
    let env = Environment {
        backend: &backend,
        store: &store,
        bridge: &bridge,
    };
    let opts = ExecuteOptions {
        jobs: usize::from(args.jobs),
        prune: !args.no_prune,
    };
    let mut progress = BatchProgress::new(ctx.verbose, ctx.quiet);
    let mut confirm = PromptConfirm::new(args.yes);

    match stackgraph::apply(&compiled, &env, &opts, &mut progress, &mut confirm) {
        Ok(summary) if was_declined(&summary) => {
            ui::warn("Cancelled");
            Ok(())
        }
        Ok(summary) => {
            if !ctx.quiet {
                print_summary(&summary);
            }
            ui::success(&format!("Applied {}", ui::count(compiled.stacks().len(), "stack")));
            Ok(())
        }
        Err(failure) => {
            print_summary(&failure.summary);
            ui::dim(failure.error.category().advice());
            Err(anyhow::Error::new(failure).context("Apply stopped; completed nodes were kept"))
        }
    }
}
