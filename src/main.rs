use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use fnforge::artifact::FunctionType;
use fnforge::config::RemoteKind;

mod cmd;

#[derive(Parser)]
#[command(name = "fnforge")]
#[command(version, about = "Build quality functions as trees of agent-written sub-functions")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding one repository per function (defaults to the current directory)
    #[arg(long, global = true, env = "FNFORGE_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Where finalized functions are pushed: github or local
    #[arg(long, global = true)]
    pub remote: Option<RemoteKind>,

    /// Account that owns the pushed repositories
    #[arg(long, global = true)]
    pub owner: Option<String>,

    /// Root directory for the local remote's bare repositories
    #[arg(long, global = true)]
    pub remote_root: Option<PathBuf>,

    /// Build attempts per node before giving up
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Agent CLI executable
    #[arg(long, global = true)]
    pub claude_cmd: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a function and the tree below it
    Create(CreateArgs),
    /// Continue an existing function's tree, optionally amending it first
    Resume {
        /// Directory of the function
        dir: PathBuf,
        /// Rebuild the function according to these instructions before continuing
        #[arg(long)]
        instructions_file: Option<PathBuf>,
    },
    /// Amend existing functions of the workspace, each in its own process
    Amend {
        /// Function names
        #[arg(required = true)]
        names: Vec<String>,
        /// Amendment instructions
        #[arg(long)]
        instructions_file: PathBuf,
    },
    /// Pretty-print an event stream read from stdin
    Events,
}

#[derive(Args, Clone)]
pub struct CreateArgs {
    /// Directory to build in (defaults to <workspace>/<name>, or a staging
    /// directory when the name is not known yet)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Function name; chosen by the agent when omitted
    #[arg(long)]
    pub name: Option<String>,

    /// scalar or vector; chosen by the agent when omitted
    #[arg(long)]
    pub function_type: Option<FunctionType>,

    /// Decomposition levels below this function
    #[arg(long, default_value_t = 1)]
    pub depth: u32,

    #[arg(long, default_value_t = 2)]
    pub branch_min_width: u32,

    #[arg(long, default_value_t = 4)]
    pub branch_max_width: u32,

    #[arg(long, default_value_t = 2)]
    pub leaf_min_width: u32,

    #[arg(long, default_value_t = 4)]
    pub leaf_max_width: u32,

    /// Specification of the function; written by the agent when omitted
    #[arg(long)]
    pub spec_file: Option<PathBuf>,

    /// JSON Schema of the function's input; written by the agent when omitted
    #[arg(long)]
    pub input_schema_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Create(args) => cmd::cmd_create(&cli, args).await,
        Commands::Resume {
            dir,
            instructions_file,
        } => cmd::cmd_resume(&cli, dir, instructions_file.as_deref()).await,
        Commands::Amend {
            names,
            instructions_file,
        } => cmd::cmd_amend(&cli, names, instructions_file).await,
        Commands::Events => cmd::cmd_events().await.map(|()| 0),
    };

    // Exit explicitly: a pending read on stdin would otherwise hold the
    // runtime open.
    let code = match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            1
        }
    };
    std::process::exit(code);
}
