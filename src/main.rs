use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use bnswap::{
    commands,
    config::Config,
    engine::SwitchEngine,
    identities::RegionTag,
    logging,
    paths::Paths,
    ui::{ColorMode, Ui},
};

#[derive(Parser)]
#[command(name = "bnswap")]
#[command(about = "Battle.net account switcher - save and swap logged-in client sessions")]
#[command(version)]
struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// When to use colors: always, auto, never
    #[arg(long, global = true, value_name = "WHEN", default_value = "auto")]
    color: ColorMode,

    /// More diagnostics on stderr (-v, -vv, -vvv); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List saved accounts
    List,

    /// Show which account the live client is using
    Current,

    /// Save the live client session as an account
    Save {
        /// Label for the account (defaults to the detected BattleTag or login)
        label: Option<String>,

        /// Region of the account: cn, global
        #[arg(long, default_value = "cn")]
        region: RegionTag,

        /// Update the matching saved account without asking
        #[arg(long)]
        update: bool,
    },

    /// Add an empty account to fill later with `update`
    Add {
        /// Label for the account
        label: String,
    },

    /// Switch the client to a saved account
    Use {
        /// Account id or label
        account: String,
    },

    /// Refresh a saved account from the live client session
    Update {
        /// Account id or label
        account: String,
    },

    /// Delete a saved account and its data
    Remove {
        /// Account id or label
        account: String,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Change an account's label
    Rename {
        /// Account id or label
        account: String,

        /// New label
        label: String,
    },

    /// Set an account's region, or toggle it when omitted
    Region {
        /// Account id or label
        account: String,

        /// cn or global
        region: Option<RegionTag>,
    },

    /// Open the client on a clean login screen to add another account
    Prepare {
        /// Region to launch the client in: cn, global
        #[arg(long, default_value = "cn")]
        region: RegionTag,
    },

    /// Show the client process and live state directories
    Status,

    /// Stop the running client
    Stop,

    /// Launch the client
    Launch {
        /// Region to launch in (defaults to the live account's region)
        #[arg(long)]
        region: Option<RegionTag>,
    },

    /// Show the effective configuration
    Config {
        /// Write a config file with the default values
        #[arg(long)]
        init: bool,
    },

    /// Run diagnostics on the bnswap setup
    Doctor,

    /// Print shell completions
    Completions {
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let ui = Ui::new(cli.color, cli.no_color);
    logging::init(cli.verbose, ui.color_enabled);

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "bnswap", &mut std::io::stdout());
        return Ok(());
    }

    let paths = Paths::new()?;
    paths.ensure_dirs()?;
    let config = Config::load(&paths.config_file)?;

    if let Commands::Config { init } = cli.command {
        return commands::config(&paths, &config, &ui, init);
    }

    let engine = SwitchEngine::from_system(paths, config)?;

    match cli.command {
        Commands::List => commands::list(&engine, &ui),
        Commands::Current => commands::current(&engine, &ui),
        Commands::Save {
            label,
            region,
            update,
        } => commands::save(&engine, &ui, label, region, update),
        Commands::Add { label } => commands::add(&engine, &ui, &label),
        Commands::Use { account } => commands::use_identity(&engine, &ui, &account),
        Commands::Update { account } => commands::update(&engine, &ui, &account),
        Commands::Remove { account, yes } => commands::remove(&engine, &ui, &account, yes),
        Commands::Rename { account, label } => commands::rename(&engine, &ui, &account, &label),
        Commands::Region { account, region } => commands::region(&engine, &ui, &account, region),
        Commands::Prepare { region } => commands::prepare(&engine, &ui, region),
        Commands::Status => commands::status(&engine, &ui),
        Commands::Stop => commands::stop(&engine, &ui),
        Commands::Launch { region } => commands::launch(&engine, &ui, region),
        Commands::Doctor => commands::doctor(&engine, &ui),
        Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
    }
}
