use std::io;
use std::io::Write;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use rrun::config::env;
use rrun::ConfigInputs;
use rrun::ExecutionOutcome;
use rrun::RunError;
use rrun::Runner;
use rrun::StdioSink;
use tracing::debug;

use crate::args::AuthArgs;
use crate::args::ConnectionArgs;
use crate::args::GlobalArgs;

/// Run a local Python script on a remote host over SSH
///
/// Every option can also be given through the environment variable named in
/// its help text.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Local script to upload and run.
    #[arg(short = 's', long, env = env::SCRIPT_PATH)]
    script: Option<Utf8PathBuf>,

    #[clap(flatten)]
    connection_args: ConnectionArgs,

    #[clap(flatten)]
    auth_args: AuthArgs,

    #[clap(flatten)]
    global_args: GlobalArgs,
}

impl Cli {
    fn into_inputs(self) -> ConfigInputs {
        ConfigInputs {
            script_path: self.script.map(Utf8PathBuf::into_string),
            host: self.connection_args.host,
            user: self.auth_args.user,
            key_path: self.auth_args.key.map(Utf8PathBuf::into_string),
            port: self.connection_args.port,
            connect_timeout: self.connection_args.connect_timeout,
            host_key_policy: self.connection_args.host_key_policy,
            known_hosts: self
                .connection_args
                .known_hosts
                .map(Utf8PathBuf::into_string),
            key_passphrase: self
                .auth_args
                .key_passphrase
                .map(|passphrase| passphrase.expose().to_owned()),
        }
    }
}

pub async fn run() -> ExitCode {
    let cli = Cli::parse();
    let _guard = match cli.global_args.init_tracing() {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("ERROR: {error:#}");
            return ExitCode::FAILURE;
        }
    };

    let inputs = cli.into_inputs();
    debug!(?inputs, "resolved inputs");

    let mut runner = Runner::new(StdioSink);
    let result = runner.run(inputs).await;
    report(&result, &mut io::stderr().lock())
}

/// Maps the run result to an exit code. A failure writes exactly one
/// `ERROR:` line to `stderr`.
fn report(result: &Result<ExecutionOutcome, RunError>, stderr: &mut impl Write) -> ExitCode {
    match result {
        Ok(outcome) => {
            debug!(
                exit_status = ?outcome.exit_status,
                exit_signal = ?outcome.exit_signal,
                "remote script finished"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            debug!(stage = %err.stage(), "run failed");
            let _ = writeln!(stderr, "ERROR: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_map_to_inputs() {
        let cli = Cli::try_parse_from([
            "rrun",
            "--script",
            "/app/train.py",
            "--host",
            "10.0.0.54",
            "--user",
            "trainer",
            "--key",
            "/secrets/id_rsa",
            "--port",
            "2222",
            "--connect-timeout",
            "5s",
            "--host-key-policy",
            "accept-new",
            "--known-hosts",
            "/tmp/known_hosts",
            "--key-passphrase",
            "hunter2",
        ])
        .unwrap();

        let inputs = cli.into_inputs();
        assert_eq!(inputs.script_path.as_deref(), Some("/app/train.py"));
        assert_eq!(inputs.host.as_deref(), Some("10.0.0.54"));
        assert_eq!(inputs.user.as_deref(), Some("trainer"));
        assert_eq!(inputs.key_path.as_deref(), Some("/secrets/id_rsa"));
        assert_eq!(inputs.port.as_deref(), Some("2222"));
        assert_eq!(inputs.connect_timeout.as_deref(), Some("5s"));
        assert_eq!(inputs.host_key_policy.as_deref(), Some("accept-new"));
        assert_eq!(inputs.known_hosts.as_deref(), Some("/tmp/known_hosts"));
        assert_eq!(inputs.key_passphrase.as_deref(), Some("hunter2"));
    }

    #[rstest]
    #[case(&["rrun", "-s", "a.py", "-H", "h", "-u", "u", "-i", "k"])]
    #[case(&["rrun", "--script=a.py", "--host=h", "--user=u", "--key=k"])]
    fn short_and_long_flags(#[case] argv: &[&str]) {
        let inputs = Cli::try_parse_from(argv).unwrap().into_inputs();
        assert_eq!(inputs.script_path.as_deref(), Some("a.py"));
        assert_eq!(inputs.host.as_deref(), Some("h"));
        assert_eq!(inputs.user.as_deref(), Some("u"));
        assert_eq!(inputs.key_path.as_deref(), Some("k"));
    }

    #[test]
    fn passphrase_is_hidden() {
        use clap::CommandFactory;
        let help = Cli::command().render_long_help().to_string();
        assert!(!help.contains("passphrase"));
        assert!(!help.contains(env::SSH_KEY_PASSPHRASE));
    }

    #[test]
    fn passphrase_is_redacted_in_debug() {
        let cli = Cli::try_parse_from(["rrun", "--key-passphrase", "hunter2"]).unwrap();
        assert!(!format!("{cli:?}").contains("hunter2"));
    }

    #[test]
    fn failure_reports_one_line() {
        let result = Err(RunError::new(
            rrun::Stage::Configuration,
            anyhow::anyhow!("SSH_HOST not set"),
        ));
        let mut stderr = Vec::new();
        let _ = report(&result, &mut stderr);
        assert_eq!(
            String::from_utf8(stderr).unwrap(),
            "ERROR: configuration failed: SSH_HOST not set\n"
        );
    }

    #[test]
    fn success_reports_nothing() {
        let mut stderr = Vec::new();
        let _ = report(&Ok(ExecutionOutcome::default()), &mut stderr);
        assert!(stderr.is_empty());
    }

    #[test]
    fn log_file_is_optional() {
        let cli = Cli::try_parse_from(["rrun", "--log-file", "/tmp/rrun.log"]).unwrap();
        assert_eq!(
            cli.global_args.log_file,
            Some(Utf8PathBuf::from("/tmp/rrun.log"))
        );
    }
}
