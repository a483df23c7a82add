//! Command-line interface definitions.

use clap::{ColorChoice, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// kiln - watch, scan, build and broadcast UI components
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Control colored output (auto, always, never)
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorChoice,

    /// Project root directory
    #[arg(short, long, global = true, default_value = ".", value_hint = clap::ValueHint::DirPath)]
    pub root: PathBuf,

    /// Config file path, relative to the root (default: kiln.toml)
    #[arg(short = 'C', long, global = true, value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Enable verbose output for debugging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Discover components and report conflicts without building
    Scan,

    /// Build every component once and exit non-zero on failures
    #[command(visible_alias = "b")]
    Build,

    /// Watch, rebuild on change and push results to connected browsers
    #[command(visible_alias = "s")]
    Serve {
        /// Network interface to bind (e.g., 127.0.0.1, 0.0.0.0)
        #[arg(short, long)]
        interface: Option<IpAddr>,

        /// Port number to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["kiln", "build", "--root", "site", "-v"]).unwrap();
        assert!(matches!(cli.command, Commands::Build));
        assert_eq!(cli.root, PathBuf::from("site"));
        assert!(cli.verbose);
        assert_eq!(cli.config, None);
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from(["kiln", "s", "--port", "9000", "-C", "dev.toml"]).unwrap();
        match cli.command {
            Commands::Serve { interface, port } => {
                assert_eq!(interface, None);
                assert_eq!(port, Some(9000));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.config, Some(PathBuf::from("dev.toml")));
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["kiln"]).is_err());
    }
}
