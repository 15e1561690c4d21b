mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use zeroize::Zeroizing;

use credvault_core::types::Generation;

#[derive(Parser)]
#[command(name = "credvault")]
#[command(about = "Encrypted device credential vault with key rotation")]
#[command(version)]
struct Cli {
    /// Path to the credvault config directory (default: ~/.credvault)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Passphrase for the keyfile (or set CREDVAULT_PASSPHRASE env var).
    /// If not provided, will prompt interactively.
    #[arg(long, global = true, env = "CREDVAULT_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config, database and keyfile
    Init,

    /// Store a credential (overwrites an existing id, keeping its statistics)
    Put {
        /// Device scope, or "*" for a credential valid on every device
        scope: String,
        username: String,
        /// Secret value; prompted for when omitted
        #[arg(long)]
        secret: Option<String>,
        /// Explicit id (default: generated)
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Refuse deletion without --force
        #[arg(long)]
        protected: bool,
    },

    /// Print a credential's secret
    Get { id: String },

    /// Replace a credential's secret
    UpdateSecret {
        id: String,
        #[arg(long)]
        secret: Option<String>,
    },

    /// Delete a credential
    Delete {
        id: String,
        /// Delete even if the credential is system-protected
        #[arg(long)]
        force: bool,
    },

    /// List credentials
    List {
        #[arg(long)]
        scope: Option<String>,
    },

    /// Rank candidate credentials for a device
    Select { scope: String },

    /// Record the outcome of a login attempt
    Outcome {
        id: String,
        #[arg(long, conflicts_with = "failure", required_unless_present = "failure")]
        success: bool,
        #[arg(long)]
        failure: bool,
    },

    /// Reset a credential's success/failure statistics
    ResetStats { id: String },

    /// Rotate the encryption key and re-encrypt every credential
    Rotate {
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Finish an interrupted or partial rotation against the current key
    Resume {
        #[arg(long)]
        json: bool,
    },

    /// List recent rotation runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Show one rotation run and its log
    Run { run_id: String },

    /// List key generations
    Keys,

    /// Reload a pruned key generation from its backup
    RestoreKey { generation: Generation },

    /// Prune a backed-up, unreferenced key generation
    Prune { generation: Generation },

    /// Rotate periodically until interrupted
    Schedule {
        /// Seconds between due checks
        #[arg(long, default_value_t = 3600)]
        check_secs: u64,
    },

    /// Show current configuration
    Config,
}

/// Get passphrase from CLI arg, env var, or interactive prompt.
pub fn get_passphrase(cli_passphrase: &Option<String>) -> anyhow::Result<Zeroizing<String>> {
    if let Some(p) = cli_passphrase {
        return Ok(Zeroizing::new(p.clone()));
    }
    let input = rpassword::read_password_from_tty(Some("Enter passphrase: "))?;
    Ok(Zeroizing::new(input))
}

/// Get a secret from the argument or an interactive prompt.
pub fn get_secret(arg: &Option<String>) -> anyhow::Result<Zeroizing<String>> {
    if let Some(s) = arg {
        return Ok(Zeroizing::new(s.clone()));
    }
    let input = rpassword::read_password_from_tty(Some("Secret: "))?;
    Ok(Zeroizing::new(input))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("credvault=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let base_dir = match cli.config_dir {
        Some(ref dir) => dir.clone(),
        None => credvault_core::config::VaultConfig::default_base_dir()?,
    };
    let pass = &cli.passphrase;

    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Init => commands::init::run(&base_dir, pass),
        Commands::Put {
            ref scope,
            ref username,
            ref secret,
            ref id,
            priority,
            protected,
        } => rt.block_on(commands::put::run(
            &base_dir,
            pass,
            commands::put::PutArgs {
                scope,
                username,
                secret,
                id: id.as_deref(),
                priority,
                protected,
            },
        )),
        Commands::Get { ref id } => rt.block_on(commands::get::run(&base_dir, pass, id)),
        Commands::UpdateSecret { ref id, ref secret } => {
            rt.block_on(commands::update_secret::run(&base_dir, pass, id, secret))
        }
        Commands::Delete { ref id, force } => commands::delete::run(&base_dir, pass, id, force),
        Commands::List { ref scope } => commands::list::run(&base_dir, pass, scope.as_deref()),
        Commands::Select { ref scope } => commands::select::run(&base_dir, pass, scope),
        Commands::Outcome { ref id, success, .. } => {
            commands::outcome::record(&base_dir, pass, id, success)
        }
        Commands::ResetStats { ref id } => commands::outcome::reset(&base_dir, pass, id),
        Commands::Rotate { json } => rt.block_on(commands::rotate::rotate(&base_dir, pass, json)),
        Commands::Resume { json } => rt.block_on(commands::rotate::resume(&base_dir, pass, json)),
        Commands::Runs { limit } => commands::runs::list(&base_dir, pass, limit),
        Commands::Run { ref run_id } => commands::runs::show(&base_dir, pass, run_id),
        Commands::Keys => rt.block_on(commands::keys::list(&base_dir, pass)),
        Commands::RestoreKey { generation } => {
            rt.block_on(commands::keys::restore(&base_dir, pass, generation))
        }
        Commands::Prune { generation } => {
            rt.block_on(commands::keys::prune(&base_dir, pass, generation))
        }
        Commands::Schedule { check_secs } => {
            rt.block_on(commands::schedule::run(&base_dir, pass, check_secs))
        }
        Commands::Config => commands::config::run(&base_dir),
    }
}
