//! `stackplan graph`

use anyhow::Result;
use stackgraph::RemoteStateBridge;

use super::{Sources, compile, load_project, state_store};
use crate::Context;
use crate::cli::GraphArgs;

pub fn run(ctx: &Context, args: &GraphArgs) -> Result<()> {
    let project = load_project(ctx)?;
    let sources = Sources::new(&project, &args.vars)?;
    let store = state_store(&project);
    let bridge = RemoteStateBridge::new(&store);

    let compiled = compile(&project, &args.stacks, &sources, &bridge)?;
    print!("{}", compiled.graph().to_dot());
    Ok(())
}
