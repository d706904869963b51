//! Command-line front end for the login session.

use crate::auth::{self, AuthState, CallbackServer, ProfileResult, is_loopback_redirect};
use crate::config::Config;
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use url::Url;

/// OAuth 2.0 login with PKCE
#[derive(Parser, Debug)]
#[command(name = "pkce-login", version, about)]
pub struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a login in the browser
    Login(LoginArgs),
    /// Complete a login from the URL the browser was redirected to
    Callback {
        /// Full redirect URL, including its query string
        url: String,
    },
    /// Fetch the signed-in user's profile
    Profile,
    /// Log out and clear the local session
    Logout,
    /// Show the current session state
    Status,
}

#[derive(Args, Debug, Default)]
pub struct LoginArgs {
    /// Don't listen for the redirect; finish later with `pkce-login callback`
    #[arg(long)]
    pub no_wait: bool,
}

impl Cli {
    /// Load the config named by `--config`, or the default one.
    pub fn load_config(&self) -> Result<Config> {
        let config = match &self.config {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file {} does not exist", path.display());
                }
                Config::load_from(path)
            }
            None => Config::load(),
        };
        config.context("Failed to load config")
    }
}

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> ExitCode {
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Commands::Login(args) => login(&config, &args).await,
        Commands::Callback { url } => callback(&config, &url).await,
        Commands::Profile => profile(&config).await,
        Commands::Logout => logout(&config).await,
        Commands::Status => status(&config),
    }
}

/// Run the login command
pub async fn login(config: &Config, args: &LoginArgs) -> ExitCode {
    match run_login(config, args).await {
        Ok(true) => {
            println!("Successfully logged in");
            ExitCode::from(0)
        }
        Ok(false) => ExitCode::from(0),
        Err(e) => {
            eprintln!("Login failed: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Returns whether the login was completed in this process.
async fn run_login(config: &Config, args: &LoginArgs) -> Result<bool> {
    let mut controller = auth::controller_from_config(config)?;
    if controller.is_authenticated() {
        bail!("Already logged in; run `pkce-login logout` first");
    }

    let redirect_uri = controller.settings().redirect_uri.clone();
    let wait = !args.no_wait && is_loopback_redirect(&redirect_uri);

    // Listen before navigating so a fast redirect isn't refused.
    let server = if wait {
        Some(
            CallbackServer::bind(&redirect_uri)
                .context("Cannot receive the redirect; retry with --no-wait")?,
        )
    } else {
        None
    };

    controller.begin_login()?;

    let Some(server) = server else {
        println!("After approving access, finish with:");
        println!("  pkce-login callback '<redirect URL>'");
        return Ok(false);
    };

    println!("Waiting for authorization...");
    let timeout = config.callback_timeout();
    let callback_url = tokio::task::spawn_blocking(move || server.wait_for_callback(timeout))
        .await
        .context("Callback listener stopped unexpectedly")??;

    // The redirect is a new page load: only durable state carries over.
    finish_callback(config, &callback_url).await?;
    Ok(true)
}

/// Run the callback command
pub async fn callback(config: &Config, url: &str) -> ExitCode {
    let result = async {
        let url = Url::parse(url).with_context(|| format!("Invalid redirect URL {url:?}"))?;
        if !url.query_pairs().any(|(k, _)| k == "code" || k == "error") {
            bail!("Redirect URL has no `code` or `error` parameter");
        }
        let mut controller = auth::controller_from_config(config)?;
        if controller.is_authenticated() {
            return Ok(false);
        }
        controller.initialize(&url).await?;
        anyhow::Ok(true)
    }
    .await;

    match result {
        Ok(true) => {
            println!("Successfully logged in");
            ExitCode::from(0)
        }
        Ok(false) => {
            println!("Already logged in; redirect URL ignored");
            ExitCode::from(0)
        }
        Err(e) => {
            eprintln!("Login failed: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn finish_callback(config: &Config, url: &Url) -> Result<()> {
    let mut controller = auth::controller_from_config(config)?;
    controller.initialize(url).await?;
    Ok(())
}

/// Run the profile command
pub async fn profile(config: &Config) -> ExitCode {
    let controller = match auth::controller_from_config(config) {
        Ok(controller) => controller,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    };

    match controller.fetch_profile().await {
        ProfileResult::Profile(profile) => {
            match serde_json::to_string_pretty(&profile) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{profile}"),
            }
            ExitCode::from(0)
        }
        ProfileResult::Failed(e) => {
            eprintln!("Failed to load profile: {e}");
            ExitCode::from(1)
        }
    }
}

/// Run the logout command
pub async fn logout(config: &Config) -> ExitCode {
    let result = async {
        let mut controller = auth::controller_from_config(config)?;
        controller.logout().await?;
        anyhow::Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            println!("Logged out");
            ExitCode::from(0)
        }
        Err(e) => {
            eprintln!("Logout failed: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Run the status command
#[must_use]
pub fn status(config: &Config) -> ExitCode {
    let controller = match auth::controller_from_config(config) {
        Ok(controller) => controller,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    };

    match controller.state() {
        AuthState::Authenticated => println!("Logged in"),
        AuthState::AwaitingCallback => {
            println!("Login in progress; waiting for the authorization redirect");
        }
        AuthState::Unauthenticated => println!("Not logged in"),
        state @ AuthState::Error { .. } => println!("{state}"),
    }
    println!("Session file: {}", config.session_path().display());
    ExitCode::from(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_login() {
        let cli = Cli::try_parse_from(["pkce-login", "login"]).unwrap();
        match cli.command {
            Commands::Login(args) => assert!(!args.no_wait),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_login_no_wait() {
        let cli = Cli::try_parse_from(["pkce-login", "login", "--no-wait"]).unwrap();
        assert!(matches!(cli.command, Commands::Login(LoginArgs { no_wait: true })));
    }

    #[test]
    fn test_parse_callback_url() {
        let cli = Cli::try_parse_from([
            "pkce-login",
            "callback",
            "http://localhost:3000/callback?code=abc",
        ])
        .unwrap();
        match cli.command {
            Commands::Callback { url } => {
                assert_eq!(url, "http://localhost:3000/callback?code=abc");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_callback_requires_url() {
        assert!(Cli::try_parse_from(["pkce-login", "callback"]).is_err());
    }

    #[test]
    fn test_parse_global_config() {
        let cli = Cli::try_parse_from(["pkce-login", "status", "--config", "/tmp/c.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(cli.command, Commands::Status));

        let cli = Cli::try_parse_from(["pkce-login", "--config", "/tmp/c.toml", "logout"]).unwrap();
        assert!(cli.config.is_some());
        assert!(matches!(cli.command, Commands::Logout));
    }

    #[test]
    fn test_parse_requires_subcommand() {
        assert!(Cli::try_parse_from(["pkce-login"]).is_err());
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "pkce-login",
            "--config",
            dir.path().join("absent.toml").to_str().unwrap(),
            "status",
        ])
        .unwrap();
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "client_id = \"cli-app\"\n").unwrap();

        let cli = Cli::try_parse_from(["pkce-login", "--config", path.to_str().unwrap(), "profile"])
            .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.client_id, "cli-app");
        assert_eq!(config.scope, "read");
    }

    #[tokio::test]
    async fn test_callback_rejects_url_without_code() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            client_id: "cli-app".into(),
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let code = callback(&config, "http://localhost:3000/callback").await;
        assert_eq!(code, ExitCode::from(1));
        assert!(!config.session_path().exists());
    }

    #[tokio::test]
    async fn test_callback_without_pending_login_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            client_id: "cli-app".into(),
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let code = callback(&config, "http://localhost:3000/callback?code=abc").await;
        assert_eq!(code, ExitCode::from(1));
    }

    #[tokio::test]
    async fn test_callback_replay_keeps_existing_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            client_id: "cli-app".into(),
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let store = auth::SessionStore::new(std::sync::Arc::new(
            auth::FileStore::open(config.session_path()).unwrap(),
        ));
        let tokens = auth::TokenSet {
            access_token: "at-1".into(),
            refresh_token: "rt-1".into(),
        };
        store.save_tokens(&tokens).unwrap();

        let code = callback(&config, "http://localhost:3000/callback?code=used").await;
        assert_eq!(code, ExitCode::from(0));
        assert_eq!(store.tokens().unwrap(), Some(tokens));
    }

    #[test]
    fn test_status_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            client_id: "cli-app".into(),
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        assert_eq!(status(&config), ExitCode::from(0));
    }
}
