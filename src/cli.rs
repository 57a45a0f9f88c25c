//! Command-line surface shared by both programs.

use clap::error::ErrorKind;
use clap::Parser;

/// `<host:port> <message-vpn> <client-username> [password]`
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(version, about = "Durable-queue client for AMQP brokers")]
pub struct Args {
    /// Broker address, `host:port`; a comma-separated list enables failover.
    pub host: String,
    /// Message VPN (AMQP virtual host).
    pub vpn: String,
    /// Client username.
    pub username: String,
    /// Client password. May begin with `-`.
    #[arg(allow_hyphen_values = true)]
    pub password: Option<String>,
    /// Further positionals are accepted and ignored.
    #[arg(hide = true, num_args = 0.., allow_hyphen_values = true)]
    extra: Vec<String>,
    /// Optional YAML file with tuning settings.
    #[arg(long)]
    pub config: Option<String>,
}

/// Why argument parsing did not produce `Args`.
#[derive(Debug)]
pub enum ArgsError {
    /// Missing or malformed positionals; print the usage line and exit non-zero.
    Usage,
    /// `--help` or `--version`; clap prints and exits with its own status.
    Info(clap::Error),
}

pub fn parse_args<I, T>(argv: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Args::try_parse_from(argv).map_err(|e| match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ArgsError::Info(e),
        _ => ArgsError::Usage,
    })
}
