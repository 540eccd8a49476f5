use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const OTA_HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nGlobal options:\n{options}\n";

pub const OTA_BEFORE_HELP: &str = concat!(
    "ota ",
    env!("CARGO_PKG_VERSION"),
    " – over-the-air bundle updates\n\n",
    "\x1b[1;36mLifecycle\x1b[0m\n",
    "  launch           Decide what to run now and print the launch asset.\n",
    "  check            Ask the update server whether a newer update exists.\n",
    "  fetch            Download the newest update without launching it.\n",
    "  reload           Switch to the best stored update.\n\n",
    "\x1b[1;36mStore\x1b[0m\n",
    "  list             Show stored updates and their status.\n",
    "  doctor           Verify every stored asset and sweep stray files.\n",
    "  reap             Remove updates the selection policy no longer keeps.\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    propagate_version = false,
    disable_help_subcommand = true,
    before_help = OTA_BEFORE_HELP,
    help_template = OTA_HELP_TEMPLATE
)]
#[allow(clippy::struct_excessive_bools)]
pub struct OtaCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[arg(
        long,
        value_name = "PATH",
        env = "OTA_CONFIG",
        help = "Read defaults from this ota.toml instead of ./ota.toml",
        global = true
    )]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CommandGroupCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandGroupCli {
    #[command(about = "Decide what to run now and print the launch asset.")]
    Launch(LaunchArgs),
    #[command(about = "Ask the update server whether a newer update exists.")]
    Check,
    #[command(about = "Download the newest update without launching it.")]
    Fetch,
    #[command(about = "Launch, then switch to the best stored update.")]
    Reload(ReloadArgs),
    #[command(about = "Show stored updates and their status.")]
    List,
    #[command(about = "Verify every stored asset and sweep stray files.")]
    Doctor(DoctorArgs),
    #[command(about = "Remove updates the selection policy no longer keeps.")]
    Reap,
}

#[derive(Args, Debug, Clone)]
pub struct LaunchArgs {
    #[arg(
        long,
        help = "Also print every local asset path of the launched update"
    )]
    pub assets: bool,
    #[command(flatten)]
    pub background: BackgroundArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ReloadArgs {
    #[command(flatten)]
    pub background: BackgroundArgs,
}

#[derive(Args, Debug, Clone)]
pub struct BackgroundArgs {
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 120,
        help = "Wait this long for background downloads and cleanup before exiting"
    )]
    pub wait_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct DoctorArgs {
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 3600,
        help = "Leave stray files younger than this alone"
    )]
    pub grace_secs: u64,
}
