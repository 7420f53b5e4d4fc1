use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "synkv",
    about = "Inspect and edit synkv namespaces on disk",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the namespaces (default: ./.synkv)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Namespace to operate on (default: settings)
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    /// TOML file with defaults for the options above
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the value stored under a key
    Get(GetArgs),
    /// Store a JSON value under a key
    Set(SetArgs),
    /// List every key in the namespace with its value
    List(ListArgs),
    /// Print changes to keys as other processes make them
    Watch(WatchArgs),
}

#[derive(Args)]
pub struct GetArgs {
    pub key: String,
}

#[derive(Args)]
pub struct SetArgs {
    pub key: String,
    /// JSON text, e.g. `true`, `"lg"` or `{"a": 1}`
    pub value: String,
    /// Store VALUE as a JSON string instead of parsing it
    #[arg(short, long)]
    pub string: bool,
}

#[derive(Args)]
pub struct ListArgs {}

#[derive(Args)]
pub struct WatchArgs {
    /// Keys to watch; every existing key when omitted
    pub keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_options_follow_subcommand() {
        let cli = Cli::parse_from([
            "synkv", "get", "zoom", "--namespace", "prefs", "--format", "json",
        ]);
        assert_eq!(cli.namespace.as_deref(), Some("prefs"));
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Command::Get(GetArgs { ref key }) if key == "zoom"));
    }

    #[test]
    fn watch_defaults_to_all_keys() {
        let cli = Cli::parse_from(["synkv", "watch"]);
        assert!(matches!(cli.command, Command::Watch(WatchArgs { ref keys }) if keys.is_empty()));
    }
}
