//! Launch Profiles
//!
//! Named entry points of the project (program + fixed arguments), exportable
//! as an editor `launch.json` and runnable as a single job.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::SweepError;
use crate::launcher::resolve_executable;
use crate::logger::JobLog;
use crate::process_manager::ProcessManager;

const DEFAULT_INTERPRETER: &str = "python";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchProfile {
    pub name: String,
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Program used to run `program`; scripts default to `python`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<PathBuf>,
}

impl LaunchProfile {
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: PathBuf::from(program),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            env: BTreeMap::new(),
            cwd: None,
            interpreter: None,
        }
    }

    /// Executable and full argument list
    pub fn command(&self) -> (PathBuf, Vec<String>) {
        let interpreter = match &self.interpreter {
            Some(interpreter) => Some(interpreter.clone()),
            None if self.program.extension().is_some_and(|ext| ext == "py") => {
                Some(PathBuf::from(DEFAULT_INTERPRETER))
            }
            None => None,
        };

        match interpreter {
            Some(interpreter) => {
                let mut args = vec![self.program.to_string_lossy().into_owned()];
                args.extend(self.args.iter().cloned());
                (interpreter, args)
            }
            None => (self.program.clone(), self.args.clone()),
        }
    }
}

/// Accepted file layouts: a plain list, or an exported `launch.json`
#[derive(Deserialize)]
#[serde(untagged)]
enum ProfileFile {
    List(Vec<LaunchProfile>),
    LaunchJson { configurations: Vec<LaunchProfile> },
}

/// Ordered set of uniquely named launch profiles
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRegistry {
    profiles: Vec<LaunchProfile>,
}

impl ProfileRegistry {
    /// Entry points shipped with the project
    pub fn builtin() -> Self {
        let profiles = vec![
            LaunchProfile::new(
                "Gaze Predictor",
                "src/atari_cr/atari_head/gaze_predictor.py",
                &[],
            ),
            LaunchProfile::new(
                "DQN Pauseable",
                "src/atari_cr/agents/dqn_atari_cr/main.py",
                &[
                    "--clip_reward",
                    "--capture_video",
                    "--env",
                    "ms_pacman",
                    "--exp_name",
                    "test_config",
                    "--total_timesteps",
                    "10000",
                    "--learning_start",
                    "1000",
                    "--debug",
                    "--pause_cost",
                    "0.05",
                    "--use_pause_env",
                    "--action_repeat",
                    "5",
                ],
            ),
            LaunchProfile::new("Hyperparameter Search", "src/atari_cr/hyperparams.py", &[]),
            LaunchProfile::new("ViT Saliency", "src/atari_cr/atari_head/vit.py", &[]),
        ];
        Self { profiles }
    }

    pub fn from_profiles(profiles: Vec<LaunchProfile>) -> Result<Self> {
        let mut seen = HashSet::new();
        for profile in &profiles {
            if profile.name.is_empty() {
                return Err(SweepError::InvalidConfig(
                    "profile name must not be empty".to_string(),
                )
                .into());
            }
            if !seen.insert(profile.name.as_str()) {
                return Err(SweepError::InvalidConfig(format!(
                    "duplicate launch profile: {}",
                    profile.name
                ))
                .into());
            }
        }
        Ok(Self { profiles })
    }

    /// Load profiles from YAML or JSON (a list, or a `launch.json` document)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profiles: {}", path.display()))?;

        let file: ProfileFile = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML profiles: {}", path.display()))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON profiles: {}", path.display()))?,
            _ => anyhow::bail!(
                "Unsupported profile format: {} (use .yaml, .yml or .json)",
                path.display()
            ),
        };

        match file {
            ProfileFile::List(profiles) | ProfileFile::LaunchJson { configurations: profiles } => {
                Self::from_profiles(profiles)
            }
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Result<&LaunchProfile> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| SweepError::UnknownProfile(name.to_string()).into())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LaunchProfile> {
        self.profiles.iter()
    }

    /// Editor debug configuration document
    pub fn to_launch_json(&self) -> serde_json::Value {
        let configurations: Vec<serde_json::Value> = self
            .profiles
            .iter()
            .map(|profile| {
                let mut entry = json!({
                    "name": profile.name,
                    "type": "debugpy",
                    "request": "launch",
                    "program": profile.program,
                    "args": profile.args,
                    "console": "integratedTerminal",
                });
                if !profile.env.is_empty() {
                    entry["env"] = json!(profile.env);
                }
                if let Some(cwd) = &profile.cwd {
                    entry["cwd"] = json!(cwd);
                }
                entry
            })
            .collect();

        json!({
            "version": "0.2.0",
            "configurations": configurations,
        })
    }

    /// Run one profile to completion, its output going to `log`
    ///
    /// Ctrl-C kills the profile's process group and returns
    /// [`SweepError::Interrupted`].
    pub async fn run(&self, name: &str, log: JobLog) -> Result<ExitStatus> {
        let profile = self.get(name)?;
        let (exe, args) = profile.command();
        let exe = resolve_executable(&exe)?;

        tracing::info!(
            "Running profile '{}': {} {}",
            profile.name,
            exe.display(),
            args.join(" ")
        );
        let mut process = ProcessManager::spawn_in(
            &profile.name,
            &exe,
            &args,
            &profile.env,
            profile.cwd.as_deref(),
            log,
        )?;

        tokio::select! {
            status = process.wait() => return status,
            Ok(()) = tokio::signal::ctrl_c() => {}
        }
        tracing::warn!("Received shutdown signal, stopping profile '{}'", profile.name);
        process.kill().await?;
        Err(SweepError::Interrupted.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{LogSink, MemoryLogSink};

    #[test]
    fn test_builtin_profiles() {
        let registry = ProfileRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec!["Gaze Predictor", "DQN Pauseable", "Hyperparameter Search", "ViT Saliency"]
        );

        let dqn = registry.get("DQN Pauseable").unwrap();
        let (exe, args) = dqn.command();
        assert_eq!(exe, PathBuf::from("python"));
        assert_eq!(args[0], "src/atari_cr/agents/dqn_atari_cr/main.py");
        assert!(args.windows(2).any(|w| w == ["--pause_cost", "0.05"]));
    }

    #[test]
    fn test_unknown_profile() {
        let err = ProfileRegistry::builtin().get("Nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SweepError>(),
            Some(SweepError::UnknownProfile(name)) if name == "Nope"
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let profile = LaunchProfile::new("a", "/bin/true", &[]);
        assert!(ProfileRegistry::from_profiles(vec![profile.clone(), profile]).is_err());
    }

    #[test]
    fn test_launch_json_shape() {
        let doc = ProfileRegistry::builtin().to_launch_json();
        assert_eq!(doc["version"], "0.2.0");

        let configurations = doc["configurations"].as_array().unwrap();
        assert_eq!(configurations.len(), 4);
        assert_eq!(configurations[1]["name"], "DQN Pauseable");
        assert_eq!(configurations[1]["type"], "debugpy");
        assert_eq!(configurations[1]["request"], "launch");
        assert_eq!(configurations[1]["args"][0], "--clip_reward");
        assert!(configurations[0].get("env").is_none());
    }

    #[test]
    fn test_exported_launch_json_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launch.json");
        let builtin = ProfileRegistry::builtin();
        std::fs::write(&path, builtin.to_launch_json().to_string()).unwrap();

        let loaded = ProfileRegistry::from_file(&path).unwrap();
        assert_eq!(loaded, builtin);
    }

    #[test]
    fn test_yaml_profile_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.yaml");
        std::fs::write(
            &path,
            "- name: eval\n  program: scripts/eval.sh\n  args: [--episodes, '5']\n  env:\n    MUJOCO_GL: egl\n",
        )
        .unwrap();

        let registry = ProfileRegistry::from_file(&path).unwrap();
        let eval = registry.get("eval").unwrap();
        assert_eq!(eval.env.get("MUJOCO_GL").map(String::as_str), Some("egl"));
        assert_eq!(eval.command().0, PathBuf::from("scripts/eval.sh"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_profile() {
        let mut profile = LaunchProfile::new("echo", "/bin/sh", &["-c", "echo $GREETING"]);
        profile.env.insert("GREETING".to_string(), "hello".to_string());
        let registry = ProfileRegistry::from_profiles(vec![profile]).unwrap();

        let sink = MemoryLogSink::new();
        let path = Path::new("echo.txt");
        let status = registry.run("echo", sink.open(path).unwrap()).await.unwrap();
        assert!(status.success());
        assert_eq!(sink.contents(path).unwrap(), "hello\n");
    }
}
