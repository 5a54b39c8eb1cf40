use clap::{Args, Parser, Subcommand, ValueEnum};
use std::num::NonZeroU32;
use std::path::PathBuf;

use crate::method::Level;
use crate::query::SearchParameters;
use crate::transport::ProcessCommand;

#[derive(Debug, Clone, Parser)]
#[command(name = "magik-session")]
#[command(about = "Drive Smallworld Magik sessions and the method finder from the terminal")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (defaults to <config dir>/magik-session/settings.json)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Start an interactive session for a GIS alias
    Run {
        #[command(flatten)]
        env: GisArgs,

        #[arg(long, value_name = "FILE")]
        environment: Option<PathBuf>,

        /// Run this program instead of runalias
        #[arg(long, value_name = "PROGRAM", conflicts_with = "alias")]
        program: Option<PathBuf>,

        #[arg(long = "program-arg", value_name = "ARG", allow_hyphen_values = true)]
        program_args: Vec<String>,

        /// Disable ANSI highlighting
        #[arg(long)]
        plain: bool,

        #[arg(required_unless_present = "program")]
        alias: Option<String>,
    },
    /// Print the GIS aliases (and optionally layered products) as JSON
    Aliases {
        #[command(flatten)]
        env: GisArgs,

        #[arg(long)]
        products: bool,
    },
    /// Run one method finder query
    Browse {
        #[command(flatten)]
        finder: FinderArgs,

        #[command(flatten)]
        search: SearchArgs,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Seconds to wait for the result set
        #[arg(long, value_name = "SECS", default_value_t = 30)]
        timeout: u64,
    },
    /// Print where a method is defined
    Locate {
        #[command(flatten)]
        finder: FinderArgs,

        method: String,

        class: String,

        #[arg(long, value_name = "PKG", default_value = "sw")]
        package: String,

        #[arg(long, value_name = "SECS", default_value_t = 30)]
        timeout: u64,
    },
    /// Print the encoded query without starting anything
    Query {
        #[command(flatten)]
        search: SearchArgs,
    },
}

#[derive(Debug, Clone, Args)]
pub struct GisArgs {
    /// Smallworld core directory
    #[arg(long, value_name = "DIR")]
    pub gis: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub aliases: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct FinderArgs {
    /// Method finder executable
    #[arg(long, value_name = "PROGRAM")]
    pub finder: Option<PathBuf>,

    #[arg(long = "finder-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub finder_args: Vec<String>,
}

impl FinderArgs {
    pub fn command(&self) -> Option<ProcessCommand> {
        self.finder
            .as_ref()
            .map(|p| ProcessCommand::new(p).args(self.finder_args.iter().cloned()))
    }
}

#[derive(Debug, Clone, Args)]
pub struct SearchArgs {
    #[arg(short = 'c', long, value_name = "CLASS", default_value = "")]
    pub class: String,

    #[arg(short = 'm', long, value_name = "METHOD", default_value = "")]
    pub method: String,

    /// Only methods defined on the class itself
    #[arg(long)]
    pub local: bool,

    #[arg(long)]
    pub args: bool,

    #[arg(long)]
    pub comments: bool,

    /// Hide methods of this level (repeatable)
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub hide: Vec<LevelArg>,

    #[arg(long, value_name = "N")]
    pub limit: Option<NonZeroU32>,
}

impl SearchArgs {
    pub fn to_parameters(&self, default_limit: NonZeroU32) -> SearchParameters {
        let mut params = SearchParameters {
            class_name: self.class.clone(),
            method_name: self.method.clone(),
            local_only: self.local,
            show_args: self.args,
            show_comments: self.comments,
            max_results: self.limit.unwrap_or(default_limit),
            ..SearchParameters::default()
        };
        for level in &self.hide {
            params.levels.set((*level).into(), false);
        }
        params
    }
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LevelArg {
    Basic,
    Advanced,
    Restricted,
    Deprecated,
    Debug,
}

impl From<LevelArg> for Level {
    fn from(arg: LevelArg) -> Self {
        match arg {
            LevelArg::Basic => Level::Basic,
            LevelArg::Advanced => Level::Advanced,
            LevelArg::Restricted => Level::Restricted,
            LevelArg::Deprecated => Level::Deprecated,
            LevelArg::Debug => Level::Debug,
        }
    }
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::DEFAULT_MAX_RESULTS;

    #[test]
    fn browse_flags_become_parameters() {
        let cli = Cli::parse_from([
            "magik-session",
            "browse",
            "--finder",
            "/bin/mf",
            "--finder-arg",
            "-pipe",
            "-c",
            "rope",
            "--local",
            "--hide",
            "debug",
            "--limit",
            "10",
        ]);
        let Commands::Browse { finder, search, .. } = cli.command else {
            panic!("expected browse");
        };

        let command = finder.command().expect("finder given");
        assert_eq!(command.args, vec!["-pipe"]);

        let params = search.to_parameters(DEFAULT_MAX_RESULTS);
        assert_eq!(params.class_name, "rope");
        assert_eq!(params.method_name, "");
        assert!(params.local_only);
        assert!(!params.levels.debug);
        assert!(params.levels.basic);
        assert_eq!(params.max_results.get(), 10);
    }

    #[test]
    fn run_needs_alias_or_program() {
        assert!(Cli::try_parse_from(["magik-session", "run"]).is_err());
        assert!(Cli::try_parse_from(["magik-session", "run", "swaf"]).is_ok());
        assert!(Cli::try_parse_from(["magik-session", "run", "--program", "/bin/sh"]).is_ok());
    }
}
