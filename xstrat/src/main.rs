use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

const IMAGE_NAME: &str = "xalgo";
const CONTAINER_ROOT: &str = "/xalgo";
const ENV_DECLARATION: &str = "environment.yml";
const DEFAULT_ENV_NAME: &str = "xalgo";
const DEFAULT_SCRIPT: &str = "safe_demo.py";
const STRATEGY_DIR: &str = "strategy";
const EXAMPLE_DIR: &str = "pyalgo/python/pyalgo/example";
const ROOT_ENV_VAR: &str = "XALGO_ROOT";
const CONDA_INSTALL_DIRS: [&str; 4] = ["miniconda3", "anaconda3", "miniforge3", "mambaforge"];

#[derive(Parser, Debug)]
#[command(name = "xstrat", version, about = "Run strategy scripts against the xalgo stack")]
struct Cli {
    /// Run inside the live xalgo container
    #[arg(long, conflicts_with = "local")]
    docker: bool,

    /// Run with the native conda environment
    #[arg(long)]
    local: bool,

    /// Emit machine readable JSON output
    #[arg(long)]
    json: bool,

    #[arg(long, hide = true)]
    root: Option<PathBuf>,

    /// Strategy script to run (path or bare name)
    script: Option<String>,

    /// Arguments forwarded to the script unchanged
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Debug, Error)]
enum XstratError {
    #[error("input error: {0}")]
    Input(String),
    #[error("toolchain error: {0}")]
    Toolchain(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    root: PathBuf,
    json: bool,
}

fn main() -> Result<(), XstratError> {
    let cli = Cli::parse();
    let root = resolve_root(cli.root.as_ref());
    let root = fs::canonicalize(&root).unwrap_or(root);
    let ctx = Context {
        root,
        json: cli.json,
    };

    match run(&cli, &ctx) {
        Ok(exit_code) => {
            if ctx.json {
                let payload = JsonResult {
                    ok: exit_code == 0,
                    result: Some(json!({ "exit_code": exit_code })),
                    error: None,
                };
                print_json(&payload)?;
            }
            std::process::exit(exit_code);
        }
        Err(err) => {
            if ctx.json {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                };
                print_json(&payload)?;
            } else {
                eprintln!("{err}");
            }
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli, ctx: &Context) -> Result<i32, XstratError> {
    if !ctx.root.is_dir() {
        return Err(XstratError::Input(format!(
            "project root does not exist: {}",
            ctx.root.display()
        )));
    }
    let requested = requested_script(cli);
    let script = resolve_script(&ctx.root, &requested)?;
    match resolve_backend(cli, ctx)? {
        StratBackend::Container(id) => run_in_container(ctx, &id, &script, &cli.args),
        StratBackend::Native => run_native(ctx, &script, &cli.args),
    }
}

fn requested_script(cli: &Cli) -> String {
    cli.script
        .clone()
        .unwrap_or_else(|| DEFAULT_SCRIPT.to_string())
}

fn resolve_root(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(ROOT_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            if dir.join(ENV_DECLARATION).exists() {
                return dir.to_path_buf();
            }
        }
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn script_candidates(root: &Path, script: &str) -> Vec<PathBuf> {
    let given = PathBuf::from(script);
    if given.is_absolute() {
        return vec![given];
    }
    vec![
        root.join(script),
        root.join(STRATEGY_DIR).join(script),
        root.join(EXAMPLE_DIR).join(script),
    ]
}

fn resolve_script(root: &Path, script: &str) -> Result<PathBuf, XstratError> {
    let candidates = script_candidates(root, script);
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }
    let tried = candidates
        .iter()
        .map(|candidate| candidate.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(XstratError::Input(format!(
        "strategy script '{script}' not found; tried: {tried}"
    )))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StratBackend {
    Container(String),
    Native,
}

fn resolve_backend(cli: &Cli, ctx: &Context) -> Result<StratBackend, XstratError> {
    if cli.local {
        return Ok(StratBackend::Native);
    }
    if cli.docker {
        return match first_running_container(ctx)? {
            Some(id) => Ok(StratBackend::Container(id)),
            None => Err(XstratError::Process(format!(
                "no running '{IMAGE_NAME}' container; start one with `xalgo --docker`"
            ))),
        };
    }
    if which::which("docker").is_err() {
        return Ok(StratBackend::Native);
    }
    match first_running_container(ctx) {
        Ok(Some(id)) => Ok(StratBackend::Container(id)),
        Ok(None) => Ok(StratBackend::Native),
        Err(err) => {
            eprintln!("docker probe failed ({err}); using the native environment");
            Ok(StratBackend::Native)
        }
    }
}

fn first_running_container(ctx: &Context) -> Result<Option<String>, XstratError> {
    let output = Command::new("docker")
        .args([
            "ps",
            "--filter",
            &format!("ancestor={IMAGE_NAME}"),
            "--format",
            "{{.ID}}",
        ])
        .current_dir(&ctx.root)
        .output()
        .map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                XstratError::Process(
                    "docker not found. Install Docker and ensure `docker` is on your PATH, or pass --local."
                        .to_string(),
                )
            } else {
                XstratError::Io(err)
            }
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(XstratError::Process(format!("docker ps failed: {stderr}")));
    }
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    // Candidates come back newest first; the first one wins.
    Ok(first_container_id(&stdout))
}

fn first_container_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn container_script_path(root: &Path, script: &Path) -> Result<String, XstratError> {
    // The rebase is lexical; a `..` left in the suffix would escape the mount.
    let relative = script
        .strip_prefix(root)
        .ok()
        .filter(|suffix| {
            !suffix
                .components()
                .any(|component| component == Component::ParentDir)
        })
        .ok_or_else(|| {
            XstratError::Input(format!(
                "script {} is outside the project root {}; the container only mounts the project root",
                script.display(),
                root.display()
            ))
        })?;
    Ok(format!("{CONTAINER_ROOT}/{}", relative.display()))
}

fn docker_exec_args(container: &str, script: &str, forwarded: &[String]) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "-w".to_string(),
        CONTAINER_ROOT.to_string(),
        container.to_string(),
        "python".to_string(),
        script.to_string(),
    ];
    // Forwarded arguments stay discrete tokens; nothing is re-quoted or joined.
    args.extend(forwarded.iter().cloned());
    args
}

fn run_in_container(
    ctx: &Context,
    container: &str,
    script: &Path,
    forwarded: &[String],
) -> Result<i32, XstratError> {
    let container_path = container_script_path(&ctx.root, script)?;
    note(
        ctx,
        &format!("Running {container_path} in container {container}"),
    );
    let status = Command::new("docker")
        .args(docker_exec_args(container, &container_path, forwarded))
        .current_dir(&ctx.root)
        .status()
        .map_err(XstratError::Io)?;
    Ok(exit_code(status))
}

fn run_native(ctx: &Context, script: &Path, forwarded: &[String]) -> Result<i32, XstratError> {
    let toolchain = require_conda()?;
    let env_name = environment_name(&ctx.root)?;
    let env_dir = find_named_env(&toolchain, ctx, &env_name)?.ok_or_else(|| {
        XstratError::Process(format!(
            "environment '{env_name}' not found; run `xalgo --setup` first"
        ))
    })?;
    let overrides = activation_env(&toolchain, &env_name, &env_dir);
    note(
        ctx,
        &format!("Running {} in environment '{env_name}'", script.display()),
    );
    let mut cmd = Command::new("python");
    cmd.arg(script).args(forwarded).current_dir(&ctx.root);
    for (key, value) in &overrides {
        cmd.env(key, value);
    }
    let status = cmd.status().map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            XstratError::Process(format!(
                "python not found in environment '{env_name}'; re-run `xalgo --setup`"
            ))
        } else {
            XstratError::Io(err)
        }
    })?;
    Ok(exit_code(status))
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(if status.success() { 0 } else { 1 })
}

#[derive(Debug, Clone)]
struct CondaToolchain {
    exe: PathBuf,
}

fn locate_conda() -> Option<CondaToolchain> {
    if let Ok(exe) = which::which("conda") {
        return Some(CondaToolchain { exe });
    }
    let home = dirs::home_dir()?;
    for install in CONDA_INSTALL_DIRS {
        let candidate = home.join(install).join("bin").join("conda");
        if candidate.exists() {
            return Some(CondaToolchain { exe: candidate });
        }
    }
    None
}

fn require_conda() -> Result<CondaToolchain, XstratError> {
    locate_conda().ok_or_else(|| {
        XstratError::Toolchain(format!(
            "conda not found on PATH or under ~/{{{}}}. Install Miniconda (https://docs.conda.io/en/latest/miniconda.html) or run the stack with `xalgo --docker`.",
            CONDA_INSTALL_DIRS.join(",")
        ))
    })
}

#[derive(Debug, Deserialize)]
struct EnvironmentFile {
    name: String,
}

fn environment_name(root: &Path) -> Result<String, XstratError> {
    let declaration = root.join(ENV_DECLARATION);
    if !declaration.is_file() {
        return Ok(DEFAULT_ENV_NAME.to_string());
    }
    let raw = fs::read_to_string(&declaration)?;
    let file: EnvironmentFile = serde_yaml::from_str(&raw)?;
    Ok(file.name)
}

#[derive(Debug, Deserialize)]
struct CondaEnvList {
    #[serde(default)]
    envs: Vec<PathBuf>,
}

fn find_named_env(
    toolchain: &CondaToolchain,
    ctx: &Context,
    name: &str,
) -> Result<Option<PathBuf>, XstratError> {
    let output = Command::new(&toolchain.exe)
        .args(["env", "list", "--json"])
        .current_dir(&ctx.root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(XstratError::Process(format!(
            "conda env list failed: {stderr}"
        )));
    }
    let parsed: CondaEnvList = serde_json::from_slice(&output.stdout)?;
    Ok(parsed
        .envs
        .iter()
        .find(|dir| dir.file_name().map(|last| last == name).unwrap_or(false))
        .cloned())
}

fn activation_env(
    toolchain: &CondaToolchain,
    env_name: &str,
    env_dir: &Path,
) -> BTreeMap<String, String> {
    let conda_bin_dir = toolchain
        .exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut overrides = BTreeMap::new();
    let mut search_path = vec![env_dir.join("bin"), conda_bin_dir];
    if let Some(existing) = env::var_os("PATH") {
        search_path.extend(env::split_paths(&existing));
    }
    if let Ok(joined) = env::join_paths(search_path) {
        overrides.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
    }
    overrides.insert("CONDA_PREFIX".to_string(), env_dir.display().to_string());
    overrides.insert("CONDA_DEFAULT_ENV".to_string(), env_name.to_string());
    overrides
}

fn note(ctx: &Context, message: &str) {
    if !ctx.json {
        println!("{message}");
    }
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), XstratError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn forwarded_arguments_keep_their_order() {
        let args = docker_exec_args(
            "0123abcd",
            "/xalgo/strategy/safe_demo.py",
            &[
                "--fast".to_string(),
                "3".to_string(),
                "--symbol=btcusdt".to_string(),
            ],
        );
        assert_eq!(
            args,
            vec![
                "exec".to_string(),
                "-w".to_string(),
                "/xalgo".to_string(),
                "0123abcd".to_string(),
                "python".to_string(),
                "/xalgo/strategy/safe_demo.py".to_string(),
                "--fast".to_string(),
                "3".to_string(),
                "--symbol=btcusdt".to_string(),
            ]
        );
    }

    #[test]
    fn candidates_are_ordered_root_then_strategy_then_examples() {
        let root = Path::new("/proj");
        let candidates = script_candidates(root, "demo.py");
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/proj/demo.py"),
                PathBuf::from("/proj/strategy/demo.py"),
                PathBuf::from("/proj/pyalgo/python/pyalgo/example/demo.py"),
            ]
        );
    }

    #[test]
    fn absolute_scripts_skip_the_search() {
        let candidates = script_candidates(Path::new("/proj"), "/abs/demo.py");
        assert_eq!(candidates, vec![PathBuf::from("/abs/demo.py")]);
    }

    #[test]
    fn resolve_script_prefers_the_project_root() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(STRATEGY_DIR)).unwrap();
        fs::write(dir.path().join("demo.py"), "pass\n").unwrap();
        fs::write(dir.path().join(STRATEGY_DIR).join("demo.py"), "pass\n").unwrap();

        let resolved = resolve_script(dir.path(), "demo.py").unwrap();
        assert_eq!(resolved, dir.path().join("demo.py"));
    }

    #[test]
    fn resolve_script_falls_back_to_the_example_directory() {
        let dir = tempdir().unwrap();
        let example_dir = dir.path().join(EXAMPLE_DIR);
        fs::create_dir_all(&example_dir).unwrap();
        fs::write(example_dir.join(DEFAULT_SCRIPT), "pass\n").unwrap();

        let resolved = resolve_script(dir.path(), DEFAULT_SCRIPT).unwrap();
        assert_eq!(resolved, example_dir.join(DEFAULT_SCRIPT));
    }

    #[test]
    fn resolve_script_lists_searched_locations() {
        let dir = tempdir().unwrap();
        let err = resolve_script(dir.path(), "ghost.py").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("ghost.py"), "{text}");
        assert!(text.contains(STRATEGY_DIR), "{text}");
    }

    #[test]
    fn container_paths_are_rebased_onto_the_mount() {
        let root = Path::new("/home/trader/xalgo");
        let script = root.join("strategy/safe_demo.py");
        let translated = container_script_path(root, &script).unwrap();
        assert_eq!(translated, "/xalgo/strategy/safe_demo.py");
    }

    #[test]
    fn scripts_outside_the_root_cannot_run_in_the_container() {
        let err = container_script_path(
            Path::new("/home/trader/xalgo"),
            Path::new("/tmp/demo.py"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("outside the project root"));
    }

    #[test]
    fn parent_components_cannot_escape_the_mount() {
        let root = Path::new("/home/trader/xalgo");
        let script = root.join("../outside.py");
        let err = container_script_path(root, &script).unwrap_err();
        assert!(err.to_string().contains("outside the project root"));
    }

    #[test]
    fn first_container_id_takes_the_first_line() {
        assert_eq!(
            first_container_id("aaa111\nbbb222\n"),
            Some("aaa111".to_string())
        );
        assert_eq!(first_container_id("\n"), None);
        assert_eq!(first_container_id(""), None);
    }

    #[test]
    fn default_script_applies_when_positional_omitted() {
        let cli = Cli::try_parse_from(["xstrat"]).unwrap();
        assert_eq!(requested_script(&cli), DEFAULT_SCRIPT);
    }

    #[test]
    fn trailing_arguments_are_captured_verbatim() {
        let cli = Cli::try_parse_from(["xstrat", "demo.py", "--fast", "-n", "3"]).unwrap();
        assert_eq!(cli.script.as_deref(), Some("demo.py"));
        assert_eq!(
            cli.args,
            vec!["--fast".to_string(), "-n".to_string(), "3".to_string()]
        );
    }

    #[test]
    fn environment_name_defaults_without_declaration() {
        let dir = tempdir().unwrap();
        assert_eq!(environment_name(dir.path()).unwrap(), DEFAULT_ENV_NAME);
    }

    #[test]
    fn environment_name_reads_the_declaration() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(ENV_DECLARATION),
            "name: trading\ndependencies: []\n",
        )
        .unwrap();
        assert_eq!(environment_name(dir.path()).unwrap(), "trading");
    }

    #[test]
    fn activation_env_prepends_the_env_bin() {
        let toolchain = CondaToolchain {
            exe: PathBuf::from("/opt/conda/bin/conda"),
        };
        let overrides = activation_env(&toolchain, "xalgo", Path::new("/opt/conda/envs/xalgo"));
        let path = overrides.get("PATH").unwrap();
        assert!(path.starts_with("/opt/conda/envs/xalgo/bin"), "{path}");
        assert_eq!(overrides.get("CONDA_DEFAULT_ENV").unwrap(), "xalgo");
    }
}
