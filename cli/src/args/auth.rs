use camino::Utf8PathBuf;
use clap::Args;
use rrun::auth::Passphrase;
use rrun::config::env;

const HEADING: Option<&str> = Some("Authentication Options");

/// Arguments for publickey authentication.
#[derive(Debug, Args, Clone)]
pub struct AuthArgs {
    /// Remote user to authenticate as.
    #[arg(short = 'u', long, env = env::SSH_USER, help_heading = HEADING)]
    pub user: Option<String>,

    /// Path to SSH private key.
    #[arg(short = 'i', long, env = env::SSH_KEY_PATH, help_heading = HEADING)]
    pub key: Option<Utf8PathBuf>,

    /// Passphrase for the private key. Kept out of help output; meant to be
    /// set through the environment.
    #[arg(long, env = env::SSH_KEY_PASSPHRASE, hide = true, hide_env_values = true)]
    pub key_passphrase: Option<Passphrase>,
}
