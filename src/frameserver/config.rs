//! Configuration for spawning and tearing down frameservers.

use super::state::FrameserverKind;
use crate::error::{Error, Result};
use crate::event::EventMask;
use crate::ipc::{CONTROL_FD, SOCKIN_FD_ENV};
use crate::memory::ShmKey;
use crate::memory::defaults::{HANDSHAKE_TIMEOUT, TERMINATE_GRACE};
use crate::observability::TracingConfig;
use crate::page::SegmentConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable carrying the segment key to the child.
pub const SHMKEY_ENV: &str = "FRAMELINK_SHMKEY";
/// Environment variable carrying the segment size to the child.
pub const SHMSIZE_ENV: &str = "FRAMELINK_SHMSIZE";

/// Placeholder substituted with the key in external arguments and env values.
pub const SHMKEY_PLACEHOLDER: &str = SHMKEY_ENV;
/// Placeholder substituted with the segment size.
pub const SHMSIZE_PLACEHOLDER: &str = SHMSIZE_ENV;

/// How the parent decides a freshly launched child is ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeMode {
    /// Block (bounded) until the child posts the event gate.
    EventGate {
        /// Give up after this long with `SpawnTimeout`.
        timeout: Duration,
    },
    /// Consider the child ready as soon as it is observed running.
    LivenessProbe,
}

impl Default for HandshakeMode {
    fn default() -> Self {
        Self::EventGate {
            timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

/// How a child is stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TeardownConfig {
    /// Time between SIGHUP and SIGKILL.
    pub grace: Duration,
    /// Polling interval while waiting out the grace period.
    pub poll_interval: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace: TERMINATE_GRACE,
            poll_interval: Duration::from_millis(5),
        }
    }
}

impl TeardownConfig {
    /// Set the grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// What to execute for a frameserver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LaunchEnv {
    /// A frameserver binary speaking this protocol, invoked as
    /// `binary <resource> <key> <mode>`.
    Builtin {
        /// Executable path.
        binary: PathBuf,
        /// Resource handed to the child.
        resource: String,
        /// Launch mode ("movie", "libretro", ...).
        mode: String,
    },
    /// An arbitrary program; `FRAMELINK_SHMKEY` and `FRAMELINK_SHMSIZE` in
    /// its arguments and environment values are substituted.
    External {
        /// Executable path.
        program: PathBuf,
        /// Arguments, placeholders allowed.
        args: Vec<String>,
        /// Extra environment, placeholders allowed in values.
        env: Vec<(String, String)>,
        /// What the program does.
        kind: FrameserverKind,
    },
}

impl LaunchEnv {
    /// Launch a protocol-speaking binary.
    pub fn builtin(binary: impl Into<PathBuf>, resource: impl Into<String>, mode: impl Into<String>) -> Self {
        Self::Builtin {
            binary: binary.into(),
            resource: resource.into(),
            mode: mode.into(),
        }
    }

    /// Launch an external program with no arguments.
    pub fn external(program: impl Into<PathBuf>) -> Self {
        Self::External {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            kind: FrameserverKind::Input,
        }
    }

    /// Append an argument (external programs only).
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        if let Self::External { args, .. } = &mut self {
            args.push(value.into());
        }
        self
    }

    /// Add an environment variable (external programs only).
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Self::External { env, .. } = &mut self {
            env.push((key.into(), value.into()));
        }
        self
    }

    /// Set the kind (external programs only).
    pub fn with_kind(mut self, new_kind: FrameserverKind) -> Self {
        if let Self::External { kind, .. } = &mut self {
            *kind = new_kind;
        }
        self
    }

    /// The kind of frameserver this launches.
    pub fn kind(&self) -> Result<FrameserverKind> {
        match self {
            Self::Builtin { mode, .. } => FrameserverKind::from_mode(mode),
            Self::External { kind, .. } => Ok(*kind),
        }
    }

    /// Resource string for diagnostics and respawn.
    pub fn source(&self) -> String {
        match self {
            Self::Builtin { resource, .. } => resource.clone(),
            Self::External { program, .. } => program.display().to_string(),
        }
    }

    /// Resolve into a concrete command line and environment.
    ///
    /// The child environment is built from scratch: only the variables named
    /// in `passthrough` are copied from this process.
    pub fn resolve(
        &self,
        key: &ShmKey,
        segment_size: usize,
        passthrough: &[String],
        with_control: bool,
    ) -> Result<LaunchCommand> {
        let size = segment_size.to_string();
        let substitute = |s: &str| {
            s.replace(SHMKEY_PLACEHOLDER, key.as_str())
                .replace(SHMSIZE_PLACEHOLDER, &size)
        };

        let mut env: Vec<(String, String)> = passthrough
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect();

        let (program, args) = match self {
            Self::Builtin {
                binary,
                resource,
                mode,
            } => {
                FrameserverKind::from_mode(mode)?;
                (
                    binary.clone(),
                    vec![resource.clone(), key.to_string(), mode.clone()],
                )
            }
            Self::External {
                program,
                args,
                env: extra,
                ..
            } => {
                env.extend(extra.iter().map(|(k, v)| (k.clone(), substitute(v))));
                (program.clone(), args.iter().map(|a| substitute(a)).collect())
            }
        };

        if program.as_os_str().is_empty() {
            return Err(Error::BadArgument("empty frameserver program path".into()));
        }

        env.push((SHMKEY_ENV.to_string(), key.to_string()));
        env.push((SHMSIZE_ENV.to_string(), size));
        if with_control {
            env.push((SOCKIN_FD_ENV.to_string(), CONTROL_FD.to_string()));
        }

        Ok(LaunchCommand { program, args, env })
    }
}

/// A fully resolved launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Executable.
    pub program: PathBuf,
    /// Arguments after argv[0].
    pub args: Vec<String>,
    /// Complete child environment.
    pub env: Vec<(String, String)>,
}

/// Everything needed to run one frameserver.
#[derive(Clone, Debug)]
pub struct FrameserverConfig {
    /// What to execute.
    pub launch: LaunchEnv,
    /// Segment sizing and negotiated options.
    pub segment: SegmentConfig,
    /// Readiness detection.
    pub handshake: HandshakeMode,
    /// Stop behaviour.
    pub teardown: TeardownConfig,
    /// Variables copied from this process into the child environment.
    pub env_passthrough: Vec<String>,
    /// Whether to set up the descriptor channel.
    pub descriptor_channel: bool,
    /// Events delivered to the sink by `tick`; others are discarded.
    pub event_mask: EventMask,
    /// Span settings.
    pub tracing: TracingConfig,
}

impl FrameserverConfig {
    /// Default configuration for `launch`.
    pub fn new(launch: LaunchEnv) -> Self {
        Self {
            launch,
            segment: SegmentConfig::default(),
            handshake: HandshakeMode::default(),
            teardown: TeardownConfig::default(),
            env_passthrough: vec!["PATH".to_string()],
            descriptor_channel: true,
            event_mask: EventMask::ALL,
            tracing: TracingConfig::default(),
        }
    }

    /// Set the segment configuration.
    pub fn with_segment(mut self, segment: SegmentConfig) -> Self {
        self.segment = segment;
        self
    }

    /// Set the handshake mode.
    pub fn with_handshake(mut self, handshake: HandshakeMode) -> Self {
        self.handshake = handshake;
        self
    }

    /// Set the teardown behaviour.
    pub fn with_teardown(mut self, teardown: TeardownConfig) -> Self {
        self.teardown = teardown;
        self
    }

    /// Replace the environment pass-through list.
    pub fn with_env_passthrough<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env_passthrough = names.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable the descriptor channel.
    pub fn with_descriptor_channel(mut self, enabled: bool) -> Self {
        self.descriptor_channel = enabled;
        self
    }

    /// Set the mask applied when `tick` drains events.
    pub fn with_event_mask(mut self, mask: EventMask) -> Self {
        self.event_mask = mask;
        self
    }

    /// Set the tracing configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ShmKey {
        ShmKey::new("/seg_m").unwrap()
    }

    #[test]
    fn test_builtin_argv_order() {
        let launch = LaunchEnv::builtin("/usr/bin/fsrv", "movie.mkv", "movie");
        let cmd = launch.resolve(&key(), 4096, &[], true).unwrap();
        assert_eq!(cmd.program, PathBuf::from("/usr/bin/fsrv"));
        assert_eq!(cmd.args, vec!["movie.mkv", "/seg_m", "movie"]);
        assert!(cmd.env.contains(&(SHMKEY_ENV.into(), "/seg_m".into())));
        assert!(cmd.env.contains(&(SHMSIZE_ENV.into(), "4096".into())));
        assert!(cmd.env.contains(&(SOCKIN_FD_ENV.into(), "5".into())));
    }

    #[test]
    fn test_builtin_rejects_unknown_mode() {
        let launch = LaunchEnv::builtin("/usr/bin/fsrv", "x", "teleport");
        assert!(matches!(
            launch.resolve(&key(), 1, &[], false),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn test_external_placeholders_substituted() {
        let launch = LaunchEnv::external("/opt/term")
            .arg("--shm=FRAMELINK_SHMKEY")
            .arg("FRAMELINK_SHMSIZE")
            .env("TERM_SEGMENT", "FRAMELINK_SHMKEY:FRAMELINK_SHMSIZE");
        let cmd = launch.resolve(&key(), 77, &[], false).unwrap();
        assert_eq!(cmd.args, vec!["--shm=/seg_m", "77"]);
        assert!(cmd.env.contains(&("TERM_SEGMENT".into(), "/seg_m:77".into())));
        assert!(!cmd.env.iter().any(|(k, _)| k == SOCKIN_FD_ENV));
    }

    #[test]
    fn test_environment_is_filtered() {
        // HOME is set in any test environment but not passed through.
        let launch = LaunchEnv::external("/bin/true");
        let cmd = launch
            .resolve(&key(), 1, &["PATH".to_string()], false)
            .unwrap();
        assert!(cmd.env.iter().all(|(k, _)| k != "HOME"));
        if std::env::var("PATH").is_ok() {
            assert!(cmd.env.iter().any(|(k, _)| k == "PATH"));
        }
    }

    #[test]
    fn test_kind_and_source() {
        let builtin = LaunchEnv::builtin("/fs", "game.so", "libretro");
        assert_eq!(builtin.kind().unwrap(), FrameserverKind::Interactive);
        assert_eq!(builtin.source(), "game.so");

        let external = LaunchEnv::external("/bin/sh").with_kind(FrameserverKind::NetClient);
        assert_eq!(external.kind().unwrap(), FrameserverKind::NetClient);
        assert_eq!(external.source(), "/bin/sh");
    }

    #[test]
    fn test_config_defaults() {
        let config = FrameserverConfig::new(LaunchEnv::external("/bin/true"));
        assert_eq!(config.env_passthrough, vec!["PATH"]);
        assert!(matches!(config.handshake, HandshakeMode::EventGate { .. }));
        assert_eq!(config.teardown.grace, TERMINATE_GRACE);
    }
}
