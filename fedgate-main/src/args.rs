use std::path::PathBuf;

use clap::Parser;

/// Arguments for running the fedgate main program
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub enum Command {
    /// Runs the gateway so it is ready to accept queries
    Run(Args),
    /// Prints the effective configuration, after defaulting, to stdout
    DumpConfig(Args),
}

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// The path of the main configuration file
    #[clap(short, long, value_parser)]
    pub config: Option<PathBuf>,
}

impl Command {
    pub(crate) fn args(&self) -> &Args {
        match self {
            Command::Run(args) => args,
            Command::DumpConfig(args) => args,
        }
    }

    /// Returns `true` if the command is [`Run`].
    ///
    /// [`Run`]: Command::Run
    #[must_use]
    #[allow(unused)]
    pub(crate) fn is_run(&self) -> bool {
        matches!(self, Self::Run(..))
    }

    /// Returns `true` if the command is [`DumpConfig`].
    ///
    /// [`DumpConfig`]: Command::DumpConfig
    #[must_use]
    pub(crate) fn is_dump_config(&self) -> bool {
        matches!(self, Self::DumpConfig(..))
    }
}
