//! Build phase documents and build environments.
//!
//! A build spec is parsed once into typed phases of tagged [`Step`]s; the
//! executor never interprets raw script text beyond handing shell steps to a
//! command runner.

use crate::core::normalize_relative_path;
use crate::errors::BuildSpecError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// The only build spec version understood.
pub const BUILD_SPEC_VERSION: &str = "0.2";

/// Command text that is parsed as the deploy step.
pub const DEPLOY_COMMAND: &str = "deploy";

/// Build phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    /// Toolchain and dependency installation.
    Install,
    /// Compilation and packaging.
    Build,
    /// Publishing; the only phase that may deploy.
    PostBuild,
}

impl PhaseName {
    /// All phases in execution order.
    pub const ALL: [Self; 3] = [Self::Install, Self::Build, Self::PostBuild];

    /// Returns the phase name as written in build spec documents.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Build => "build",
            Self::PostBuild => "post_build",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a phase's command list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "command", rename_all = "snake_case")]
pub enum Step {
    /// A shell command, run verbatim.
    Shell(String),
    /// The call to the deploy API with the build artifact.
    Deploy,
}

impl Step {
    fn parse(text: &str, phase: PhaseName) -> Result<Self, BuildSpecError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(BuildSpecError::EmptyCommand {
                phase: phase.to_string(),
            });
        }
        if trimmed == DEPLOY_COMMAND {
            return Ok(Self::Deploy);
        }
        Ok(Self::Shell(text.to_string()))
    }

    /// Returns the text of the step as declared.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Shell(command) => command,
            Self::Deploy => DEPLOY_COMMAND,
        }
    }
}

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPhase {
    /// The phase.
    pub name: PhaseName,
    /// Steps in declared order.
    pub steps: Vec<Step>,
}

impl BuildPhase {
    /// Returns the declared command texts, in order.
    #[must_use]
    pub fn command_texts(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.text().to_string()).collect()
    }
}

/// Which files make up the build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactsSpec {
    /// Paths or patterns, relative to `base_directory`.
    ///
    /// `**/*` selects everything; `dir/**/*` or `dir` selects a directory
    /// recursively; anything else names a single file.
    pub files: Vec<String>,
    /// Directory the output paths are relative to.
    pub base_directory: Option<String>,
}

impl Default for ArtifactsSpec {
    fn default() -> Self {
        Self {
            files: vec!["**/*".to_string()],
            base_directory: None,
        }
    }
}

/// A validated build phase document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSpec {
    version: String,
    variables: BTreeMap<String, String>,
    phases: Vec<BuildPhase>,
    cache_paths: Vec<String>,
    artifacts: ArtifactsSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBuildSpec {
    version: String,
    #[serde(default)]
    env: Option<RawEnv>,
    #[serde(default)]
    phases: BTreeMap<PhaseName, RawPhase>,
    #[serde(default)]
    cache: Option<RawCache>,
    #[serde(default)]
    artifacts: Option<RawArtifacts>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawEnv {
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawPhase {
    #[serde(default)]
    commands: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawCache {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawArtifacts {
    #[serde(default)]
    files: Vec<String>,
    #[serde(default, rename = "base-directory")]
    base_directory: Option<String>,
}

impl<'de> Deserialize<'de> for BuildSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawBuildSpec::deserialize(deserializer)?;
        Self::from_raw(raw).map_err(serde::de::Error::custom)
    }
}

impl BuildSpec {
    /// Returns a builder for assembling a spec in code.
    #[must_use]
    pub fn builder() -> BuildSpecBuilder {
        BuildSpecBuilder::default()
    }

    /// Parses and validates a JSON build spec document.
    ///
    /// # Errors
    ///
    /// Returns `BuildSpecError::Parse` for malformed documents, or the
    /// validation error for well-formed but invalid ones.
    pub fn from_json_str(document: &str) -> Result<Self, BuildSpecError> {
        let raw: RawBuildSpec =
            serde_json::from_str(document).map_err(|e| BuildSpecError::Parse(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawBuildSpec) -> Result<Self, BuildSpecError> {
        if raw.version != BUILD_SPEC_VERSION {
            return Err(BuildSpecError::UnsupportedVersion(raw.version));
        }

        // BTreeMap iteration follows PhaseName's declaration order.
        let mut phases = Vec::new();
        for (name, raw_phase) in raw.phases {
            if raw_phase.commands.is_empty() {
                continue;
            }
            let steps = raw_phase
                .commands
                .iter()
                .map(|c| Step::parse(c, name))
                .collect::<Result<Vec<_>, _>>()?;
            phases.push(BuildPhase { name, steps });
        }

        let mut deploys = 0usize;
        for phase in &phases {
            for step in &phase.steps {
                if *step == Step::Deploy {
                    if phase.name != PhaseName::PostBuild {
                        return Err(BuildSpecError::DeployOutsideFinalPhase {
                            phase: phase.name.to_string(),
                        });
                    }
                    deploys += 1;
                }
            }
        }
        if deploys > 1 {
            return Err(BuildSpecError::DuplicateDeploy);
        }

        let cache_paths = raw
            .cache
            .unwrap_or_default()
            .paths
            .iter()
            .map(|p| normalize_relative_path(p))
            .collect::<Result<Vec<_>, _>>()?;

        let artifacts = match raw.artifacts {
            Some(a) if !a.files.is_empty() => {
                for pattern in &a.files {
                    validate_pattern(pattern)?;
                }
                let base_directory = a
                    .base_directory
                    .as_deref()
                    .map(normalize_relative_path)
                    .transpose()?;
                ArtifactsSpec {
                    files: a.files,
                    base_directory,
                }
            }
            _ => ArtifactsSpec::default(),
        };

        Ok(Self {
            version: raw.version,
            variables: raw.env.unwrap_or_default().variables,
            phases,
            cache_paths,
            artifacts,
        })
    }

    /// Returns the document version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the phases to run, in order. Phases without commands are omitted.
    #[must_use]
    pub fn phases(&self) -> &[BuildPhase] {
        &self.phases
    }

    /// Returns the environment variables declared by the spec.
    #[must_use]
    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    /// Returns the cached paths.
    #[must_use]
    pub fn cache_paths(&self) -> &[String] {
        &self.cache_paths
    }

    /// Returns the artifact selection.
    #[must_use]
    pub fn artifacts(&self) -> &ArtifactsSpec {
        &self.artifacts
    }

    /// Returns true if the spec contains the deploy step.
    #[must_use]
    pub fn has_deploy_step(&self) -> bool {
        self.phases
            .iter()
            .any(|p| p.steps.iter().any(|s| *s == Step::Deploy))
    }
}

fn validate_pattern(pattern: &str) -> Result<(), BuildSpecError> {
    if pattern == "**/*" || pattern == "**" {
        return Ok(());
    }
    let prefix = pattern.strip_suffix("/**/*").unwrap_or(pattern);
    normalize_relative_path(prefix).map(|_| ())
}

/// Assembles a [`BuildSpec`] in code.
#[derive(Debug, Clone, Default)]
pub struct BuildSpecBuilder {
    raw: RawBuildSpec,
}

impl BuildSpecBuilder {
    fn phase(mut self, name: PhaseName, commands: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.raw
            .phases
            .entry(name)
            .or_default()
            .commands
            .extend(commands.into_iter().map(Into::into));
        self
    }

    /// Appends commands to the install phase.
    #[must_use]
    pub fn install(self, commands: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.phase(PhaseName::Install, commands)
    }

    /// Appends commands to the build phase.
    #[must_use]
    pub fn build_phase(self, commands: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.phase(PhaseName::Build, commands)
    }

    /// Appends commands to the post-build phase.
    #[must_use]
    pub fn post_build(self, commands: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.phase(PhaseName::PostBuild, commands)
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.raw
            .env
            .get_or_insert_with(RawEnv::default)
            .variables
            .insert(key.into(), value.into());
        self
    }

    /// Adds a cached path.
    #[must_use]
    pub fn cache_path(mut self, path: impl Into<String>) -> Self {
        self.raw
            .cache
            .get_or_insert_with(RawCache::default)
            .paths
            .push(path.into());
        self
    }

    /// Adds an output file pattern.
    #[must_use]
    pub fn artifact_file(mut self, pattern: impl Into<String>) -> Self {
        self.raw
            .artifacts
            .get_or_insert_with(RawArtifacts::default)
            .files
            .push(pattern.into());
        self
    }

    /// Sets the directory output paths are relative to.
    #[must_use]
    pub fn base_directory(mut self, dir: impl Into<String>) -> Self {
        self.raw
            .artifacts
            .get_or_insert_with(RawArtifacts::default)
            .base_directory = Some(dir.into());
        self
    }

    /// Validates and returns the spec.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn build(mut self) -> Result<BuildSpec, BuildSpecError> {
        BUILD_SPEC_VERSION.clone_into(&mut self.raw.version);
        BuildSpec::from_raw(self.raw)
    }
}

/// The container image and settings every build runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEnvironment {
    /// Base image reference, pinned to a tag or digest.
    pub image: String,
    /// Environment variables for every command.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Wall-clock limit per command, in seconds.
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
}

fn default_command_timeout_seconds() -> u64 {
    3600
}

impl BuildEnvironment {
    /// Creates an environment for `image` with default settings.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            variables: BTreeMap::new(),
            command_timeout_seconds: default_command_timeout_seconds(),
        }
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Sets the per-command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_seconds = timeout.as_secs().max(1);
        self
    }

    /// Returns the per-command timeout.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    /// Checks that the image is pinned.
    ///
    /// # Errors
    ///
    /// Returns `BuildSpecError::UnpinnedImage` for untagged or `latest` images.
    pub fn validate(&self) -> Result<(), BuildSpecError> {
        if is_pinned_image(&self.image) {
            Ok(())
        } else {
            Err(BuildSpecError::UnpinnedImage {
                image: self.image.clone(),
            })
        }
    }

    /// Returns a copy with `extra` variables layered on top.
    #[must_use]
    pub fn layered(&self, extra: &BTreeMap<String, String>) -> Self {
        let mut env = self.clone();
        env.variables
            .extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Returns true if an image reference names a fixed version.
///
/// Accepted: `name@sha256:<64 hex>` or `name:<tag>` with a tag other than `latest`.
#[must_use]
pub fn is_pinned_image(image: &str) -> bool {
    static DIGEST: OnceLock<Option<Regex>> = OnceLock::new();
    let digest = DIGEST
        .get_or_init(|| Regex::new(r"^[^@\s]+@sha256:[0-9a-f]{64}$").ok())
        .as_ref();
    if digest.is_some_and(|re| re.is_match(image)) {
        return true;
    }
    if image.contains('@') || image.chars().any(char::is_whitespace) {
        return false;
    }

    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.split_once(':') {
        Some((name, tag)) => !name.is_empty() && !tag.is_empty() && tag != "latest",
        None => false,
    }
}
