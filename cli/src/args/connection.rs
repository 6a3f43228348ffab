use camino::Utf8PathBuf;
use clap::Args;
use rrun::config::env;

const HEADING: Option<&str> = Some("Connection Options");

/// Arguments for reaching and trusting the remote host.
///
/// Values are passed through as given and validated by the library, so a bad
/// value is reported the same way whether it came from a flag or the
/// environment.
#[derive(Debug, Args, Clone)]
pub struct ConnectionArgs {
    /// Remote host name or address.
    #[arg(short = 'H', long, env = env::SSH_HOST, help_heading = HEADING)]
    pub host: Option<String>,

    /// Remote SSH port [default: 22]
    #[arg(short = 'p', long, env = env::SSH_PORT, help_heading = HEADING)]
    pub port: Option<String>,

    /// Time to allow TCP connect, handshake and authentication to complete,
    /// as seconds or a duration like "500ms" [default: 20s]
    #[arg(long, env = env::SSH_CONNECT_TIMEOUT, help_heading = HEADING)]
    pub connect_timeout: Option<String>,

    /// How to treat unknown or changed host keys: accept-all, accept-new or
    /// strict [default: accept-all]
    #[arg(long, env = env::SSH_HOST_KEY_POLICY, help_heading = HEADING)]
    pub host_key_policy: Option<String>,

    /// known_hosts file used by accept-new and strict [default:
    /// ~/.ssh/known_hosts]
    #[arg(long, env = env::SSH_KNOWN_HOSTS, help_heading = HEADING)]
    pub known_hosts: Option<Utf8PathBuf>,
}
