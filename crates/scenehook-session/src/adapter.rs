// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session backends: the capability set every remote target exposes, and
//! the hook-program implementation of it.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fmt::Write as _;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use scenehook_cas::AssetKey;
use scenehook_proto::{pack_rgba, SceneMeta};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Default bound on one hook invocation.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// A failed backend call. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op}: {message}")]
pub struct AdapterError {
    /// Capability or hook subcommand that failed.
    pub op: String,
    /// What went wrong.
    pub message: String,
}

impl AdapterError {
    /// Build an error for `op`.
    pub fn new(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            message: message.into(),
        }
    }
}

/// `key=value` facts a backend reports about one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo(BTreeMap<String, String>);

impl SessionInfo {
    /// Value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Rendering backend, `""` when unreported.
    pub fn backend(&self) -> &str {
        self.get("backend").unwrap_or_default()
    }

    /// Operating system, `""` when unreported.
    pub fn system(&self) -> &str {
        self.get("system").unwrap_or_default()
    }

    /// All facts, ordered by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SessionInfo {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Scene parameters handed to the target along with the scene file.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMetadata {
    /// Duration in seconds.
    pub duration: f64,
    /// Framerate as a rational.
    pub framerate: (u32, u32),
    /// Aspect ratio as a rational.
    pub aspect_ratio: (u32, u32),
    /// Clear color (RGBA, 0..=1).
    pub clear_color: [f32; 4],
    /// MSAA sample count.
    pub samples: u32,
}

impl From<&SceneMeta> for PushMetadata {
    fn from(meta: &SceneMeta) -> Self {
        Self {
            duration: meta.duration,
            framerate: meta.framerate,
            aspect_ratio: meta.aspect_ratio,
            clear_color: meta.clear_color,
            samples: meta.samples,
        }
    }
}

impl PushMetadata {
    /// `key=value` arguments of the `scene_change` hook.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            format!("duration={:.6}", self.duration),
            format!("framerate={}/{}", self.framerate.0, self.framerate.1),
            format!("aspect_ratio={}/{}", self.aspect_ratio.0, self.aspect_ratio.1),
            format!("clear_color={:08X}", pack_rgba(self.clear_color)),
            format!("samples={}", self.samples),
        ]
    }
}

/// Capability set of one session backend.
pub trait SessionBackend: Send + Sync {
    /// `(local id, description)` of every reachable session.
    fn enumerate_sessions(
        &self,
    ) -> impl Future<Output = Result<Vec<(String, String)>, AdapterError>> + Send;

    /// Probe one session.
    fn describe(&self, local: &str) -> impl Future<Output = Result<SessionInfo, AdapterError>> + Send;

    /// Make `path` available to the session; returns the remote path.
    fn sync_asset(
        &self,
        local: &str,
        path: &Path,
    ) -> impl Future<Output = Result<PathBuf, AdapterError>> + Send;

    /// Hand the serialized scene at `scene_file` to the session.
    fn push_scene(
        &self,
        local: &str,
        scene_file: &Path,
        meta: &PushMetadata,
    ) -> impl Future<Output = Result<(), AdapterError>> + Send;
}

/// A hook program plus the arguments placed before its subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCommand {
    /// Executable.
    pub program: PathBuf,
    /// Leading arguments (e.g. the script run by an interpreter).
    pub args: Vec<String>,
}

impl HookCommand {
    /// Split a command line on whitespace (`"sh ./hooks/tv.sh"`).
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let program = PathBuf::from(words.next()?);
        Some(Self {
            program,
            args: words.map(str::to_owned).collect(),
        })
    }
}

/// Backend driven by an external hook program:
///
/// ```text
/// <program> <args...> get_sessions
/// <program> <args...> get_session_info <id>
/// <program> <args...> sync_file <id> <local path> <remote hint>
/// <program> <args...> scene_change <id> <scene file> duration=.. framerate=.. ...
/// ```
#[derive(Debug, Clone)]
pub struct ScriptBackend {
    command: HookCommand,
    timeout: Duration,
}

impl ScriptBackend {
    /// Wrap `command`. Fails when the program cannot be found.
    pub fn new(command: HookCommand) -> Result<Self, AdapterError> {
        if !program_exists(&command.program) {
            return Err(AdapterError::new(
                "load",
                format!("hook program {} not found", command.program.display()),
            ));
        }
        Ok(Self {
            command,
            timeout: DEFAULT_HOOK_TIMEOUT,
        })
    }

    /// Bound every invocation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wrapped command.
    pub fn command(&self) -> &HookCommand {
        &self.command
    }

    async fn invoke(&self, op: &str, args: Vec<OsString>) -> Result<String, AdapterError> {
        debug!(program = %self.command.program.display(), op, ?args, "invoking hook");
        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg(op)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                AdapterError::new(
                    op,
                    format!("cannot spawn {}: {err}", self.command.program.display()),
                )
            })?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AdapterError::new(op, format!("timed out after {:?}", self.timeout)))?
            .map_err(|err| AdapterError::new(op, err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut message = format!("hook exited with {}", output.status);
            if !stderr.trim().is_empty() {
                let _ = write!(message, ": {}", stderr.trim());
            }
            return Err(AdapterError::new(op, message));
        }
        String::from_utf8(output.stdout)
            .map_err(|_| AdapterError::new(op, "hook output is not UTF-8"))
    }
}

fn program_exists(program: &Path) -> bool {
    if program.components().count() > 1 {
        return program.is_file();
    }
    env::var_os("PATH").is_some_and(|paths| {
        env::split_paths(&paths).any(|dir| dir.join(program).is_file())
    })
}

fn parse_sessions(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once(' ') {
            Some((id, description)) => (id.to_owned(), description.trim().to_owned()),
            None => (line.to_owned(), String::new()),
        })
        .collect()
}

fn parse_info(stdout: &str) -> Result<SessionInfo, AdapterError> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
                .ok_or_else(|| {
                    AdapterError::new("get_session_info", format!("expected key=value, got {line:?}"))
                })
        })
        .collect()
}

impl SessionBackend for ScriptBackend {
    async fn enumerate_sessions(&self) -> Result<Vec<(String, String)>, AdapterError> {
        Ok(parse_sessions(&self.invoke("get_sessions", Vec::new()).await?))
    }

    async fn describe(&self, local: &str) -> Result<SessionInfo, AdapterError> {
        parse_info(&self.invoke("get_session_info", vec![local.into()]).await?)
    }

    async fn sync_asset(&self, local: &str, path: &Path) -> Result<PathBuf, AdapterError> {
        let hint = AssetKey::for_file(path)
            .map_err(|err| AdapterError::new("sync_file", format!("{}: {err}", path.display())))?
            .remote_name(path);
        let stdout = self
            .invoke(
                "sync_file",
                vec![local.into(), path.into(), hint.clone().into_os_string()],
            )
            .await?;
        let printed = stdout.trim();
        Ok(if printed.is_empty() {
            hint
        } else {
            PathBuf::from(printed)
        })
    }

    async fn push_scene(
        &self,
        local: &str,
        scene_file: &Path,
        meta: &PushMetadata,
    ) -> Result<(), AdapterError> {
        let mut args: Vec<OsString> = vec![local.into(), scene_file.into()];
        args.extend(meta.to_args().into_iter().map(OsString::from));
        self.invoke("scene_change", args).await.map(drop)
    }
}
