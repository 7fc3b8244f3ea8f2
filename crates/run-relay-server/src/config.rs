//! Command-line and environment configuration.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use run_relay_executor::CommandBuilder;
use run_relay_session::AdmissionPolicy;

/// Relay agent runs to HTTP clients as server-sent events.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "RUN_RELAY_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// Admission policy: `multi-session` or `single-flight`
    #[arg(long, env = "RUN_RELAY_MODE", default_value = "multi-session")]
    pub mode: AdmissionPolicy,

    /// Seconds between keep-alive frames on open event streams
    #[arg(
        long,
        env = "RUN_RELAY_KEEP_ALIVE_SECS",
        default_value_t = 15,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub keep_alive_secs: u64,

    /// Agent command line, shell-split (e.g. "my-agent --json")
    #[arg(long, env = "RUN_RELAY_AGENT_COMMAND")]
    pub agent_command: String,

    /// Extra argument passed verbatim to the agent (repeatable)
    #[arg(long = "agent-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub agent_args: Vec<String>,

    /// Working directory for agent processes (defaults to the current directory)
    #[arg(long, env = "RUN_RELAY_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// Allowed CORS origins, comma separated; `*` allows any
    #[arg(long = "allow-origin", env = "RUN_RELAY_ALLOW_ORIGIN", value_delimiter = ',')]
    pub allow_origins: Vec<String>,
}

impl Args {
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    #[must_use]
    pub fn command_builder(&self) -> CommandBuilder {
        let builder = CommandBuilder::new(self.agent_command.clone());
        if self.agent_args.is_empty() {
            builder
        } else {
            builder.params(self.agent_args.iter().cloned())
        }
    }

    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        self.working_dir.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("run-relay").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let args = parse(&["--agent-command", "agent --json"]).unwrap();
        assert_eq!(args.bind, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(args.mode, AdmissionPolicy::MultiSession);
        assert_eq!(args.keep_alive(), Duration::from_secs(15));
        assert!(args.allow_origins.is_empty());
    }

    #[test]
    fn single_flight_mode_and_origins() {
        let args = parse(&[
            "--agent-command",
            "agent",
            "--mode",
            "single-flight",
            "--allow-origin",
            "http://a.test,http://b.test",
            "--agent-arg",
            "--verbose",
        ])
        .unwrap();
        assert_eq!(args.mode, AdmissionPolicy::SingleFlight);
        assert_eq!(args.allow_origins, ["http://a.test", "http://b.test"]);
        assert_eq!(args.agent_args, ["--verbose"]);
    }

    #[test]
    fn rejects_zero_keep_alive_and_unknown_mode() {
        assert!(parse(&["--agent-command", "agent", "--keep-alive-secs", "0"]).is_err());
        assert!(parse(&["--agent-command", "agent", "--mode", "both"]).is_err());
    }
}
