// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `scenehook`: inspect hook-backed sessions and manage saved toggles.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scenehook_app_core::config::ConfigService;
use scenehook_app_core::prefs::{HooksPrefs, HOOKS_PREFS_KEY};
use scenehook_config_fs::FsConfigStore;
use scenehook_session::{setup, HookCommand, ScriptBackend, SessionId, SessionRegistry};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "SceneHook session tools")]
struct Args {
    /// Hook command line (repeatable), e.g. "sh ./hooks/desktop.sh". Defaults to the saved hooks.
    #[arg(long = "hook")]
    hooks: Vec<String>,
    /// Upper bound on one hook invocation, in seconds
    #[arg(long)]
    timeout: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every session with its reported information
    Sessions,
    /// Sync one file to a session and print the remote path
    Sync {
        /// Composite session id (e.g. 0:desktop)
        session: SessionId,
        /// Local file to sync
        file: PathBuf,
    },
    /// Remember a session as enabled
    Enable {
        /// Composite session id
        session: SessionId,
    },
    /// Remember a session as disabled
    Disable {
        /// Composite session id
        session: SessionId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = match FsConfigStore::new() {
        Ok(store) => Some(ConfigService::new(store)),
        Err(err) => {
            warn!(%err, "config directory unavailable; using defaults");
            None
        }
    };
    let mut prefs: HooksPrefs = config
        .as_ref()
        .map(|svc| svc.load_or_default(HOOKS_PREFS_KEY))
        .unwrap_or_default();
    if let Some(secs) = args.timeout {
        prefs.hook_timeout_secs = secs;
    }

    match args.command {
        Command::Sessions => {
            let registry = registry(&args.hooks, &prefs)?;
            let mut out = std::io::stdout().lock();
            for (id, description) in registry.list_sessions().await {
                writeln!(out, "{id}\t{description}")?;
                match registry.get_session_info(&id).await {
                    Ok(info) => {
                        for (key, value) in info.iter() {
                            writeln!(out, "    {key}={value}")?;
                        }
                    }
                    Err(err) => writeln!(out, "    error: {err}")?,
                }
            }
        }
        Command::Sync { session, file } => {
            let registry = registry(&args.hooks, &prefs)?;
            if session.backend_index() >= registry.backends().len() {
                bail!("no backend {} for session {session}", session.backend_index());
            }
            let remote = registry.sync_file(&session, &file).await?;
            writeln!(std::io::stdout().lock(), "{}", remote.display())?;
        }
        Command::Enable { session } => save_toggle(config.as_ref(), prefs, &session, true)?,
        Command::Disable { session } => save_toggle(config.as_ref(), prefs, &session, false)?,
    }
    Ok(())
}

fn registry(lines: &[String], prefs: &HooksPrefs) -> Result<SessionRegistry<ScriptBackend>> {
    let backends = if lines.is_empty() {
        setup::backends(prefs)?
    } else {
        lines
            .iter()
            .map(|line| {
                let command = HookCommand::parse(line)
                    .with_context(|| format!("empty hook command line: {line:?}"))?;
                Ok(ScriptBackend::new(command)?
                    .with_timeout(Duration::from_secs(prefs.hook_timeout_secs)))
            })
            .collect::<Result<Vec<_>>>()?
    };
    if backends.is_empty() {
        bail!("no hooks configured: pass --hook or save them under \"{HOOKS_PREFS_KEY}\"");
    }
    Ok(SessionRegistry::new(backends))
}

fn save_toggle(
    config: Option<&ConfigService<FsConfigStore>>,
    mut prefs: HooksPrefs,
    session: &SessionId,
    enabled: bool,
) -> Result<()> {
    let config = config.context("config directory unavailable")?;
    prefs.sessions_enabled.insert(session.to_string(), enabled);
    config.save(HOOKS_PREFS_KEY, &prefs)?;
    info!(%session, enabled, "saved session toggle");
    Ok(())
}
