use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stackplan")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Plan and apply declarative infrastructure stacks", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Project file
    #[arg(
        short,
        long,
        global = true,
        env = "STACKPLAN_PROJECT",
        default_value = crate::config::PROJECT_FILE
    )]
    pub project: PathBuf,

    /// Directory holding stack state files (overrides the project's state_dir)
    #[arg(long, global = true, env = "STACKPLAN_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Load the project, bind variables and compile every stack
    Validate(VarArgs),

    /// Show the execution plan
    Plan(PlanArgs),

    /// Apply stacks in dependency order
    Apply(ApplyArgs),

    /// Destroy applied nodes in reverse dependency order
    Destroy(DestroyArgs),

    /// Show the persisted outputs of a stack
    Outputs {
        /// Stack name
        stack: String,

        /// Print as JSON (sensitive values stay masked)
        #[arg(long)]
        json: bool,
    },

    /// Print the dependency graph in DOT format
    Graph(GraphArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Shared Arguments
// ============================================================================

#[derive(Args, Clone, Default)]
pub struct VarArgs {
    /// Set a variable (NAME=VALUE or STACK.NAME=VALUE), repeatable
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Read variables from a TOML file
    #[arg(long, value_name = "FILE")]
    pub var_file: Option<PathBuf>,
}

// ============================================================================
// Plan / Apply / Destroy
// ============================================================================

#[derive(Args)]
pub struct PlanArgs {
    /// Stacks to plan (default: all, in declaration order)
    pub stacks: Vec<String>,

    /// Write the plan artifact to FILE
    #[arg(short, long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Compare with a previously written plan artifact
    #[arg(long, value_name = "FILE")]
    pub diff: Option<PathBuf>,

    #[command(flatten)]
    pub vars: VarArgs,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Stacks to apply (default: all, in declaration order)
    pub stacks: Vec<String>,

    /// Number of nodes applied concurrently
    #[arg(short, long, default_value = "4")]
    pub jobs: u16,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Show what would be applied without applying
    #[arg(long)]
    pub dry_run: bool,

    /// Keep recorded nodes that are no longer declared
    #[arg(long)]
    pub no_prune: bool,

    /// Make the simulated backend fail for this node address
    #[arg(long, value_name = "STACK.NODE", hide = true)]
    pub simulate_failure: Vec<String>,

    #[command(flatten)]
    pub vars: VarArgs,
}

#[derive(Args)]
pub struct GraphArgs {
    /// Stacks to include (default: all)
    pub stacks: Vec<String>,

    #[command(flatten)]
    pub vars: VarArgs,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Stacks to destroy (default: all)
    pub stacks: Vec<String>,

    /// Number of nodes destroyed concurrently
    #[arg(short, long, default_value = "4")]
    pub jobs: u16,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    #[command(flatten)]
    pub vars: VarArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from([
            "stackplan",
            "-vv",
            "apply",
            "network",
            "--jobs",
            "2",
            "--yes",
            "--var",
            "REGION=us-east-1",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(args.stacks, vec!["network"]);
        assert_eq!(args.jobs, 2);
        assert!(args.yes);
        assert_eq!(args.vars.vars, vec!["REGION=us-east-1"]);
    }

    #[test]
    fn test_global_project_flag() {
        let cli =
            Cli::try_parse_from(["stackplan", "graph", "-p", "demos/eks/stackplan.toml"]).unwrap();
        assert_eq!(cli.project, PathBuf::from("demos/eks/stackplan.toml"));
    }
}
