use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use clap::{Parser, ValueEnum};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

const IMAGE_NAME: &str = "xalgo";
const CONTAINER_ROOT: &str = "/xalgo";
const REGISTRY_VOLUME: &str = "xalgo-cargo-registry";
const TARGET_VOLUME: &str = "xalgo-target";
const CARGO_REGISTRY_MOUNT: &str = "/usr/local/cargo/registry";
const ENV_DECLARATION: &str = "environment.yml";
const CREDENTIAL_FILE: &str = "private_key.pem";
const DEFAULT_ENV_NAME: &str = "xalgo";
const EXTENSION_MANIFEST: &str = "pyalgo/Cargo.toml";
const SERVICE_PORT: u16 = 8111;
const SERVICE_LOG_LEVEL: &str = "info";
const ROOT_ENV_VAR: &str = "XALGO_ROOT";
const CONDA_INSTALL_DIRS: [&str; 4] = ["miniconda3", "anaconda3", "miniforge3", "mambaforge"];
const CONDA_INSTALL_HINT: &str =
    "Install Miniconda (https://docs.conda.io/en/latest/miniconda.html) or run with --docker.";

#[derive(Parser, Debug)]
#[command(name = "xalgo", version, about = "Build and launch the xalgo trading stack")]
struct Cli {
    /// Trading mode to build and launch
    #[arg(value_enum, default_value_t = ExecutionMode::Spot)]
    mode: ExecutionMode,

    /// Provision the conda environment and exit
    #[arg(long)]
    setup: bool,

    /// Force the containerized backend
    #[arg(long, conflicts_with = "local")]
    docker: bool,

    /// Force the native backend
    #[arg(long)]
    local: bool,

    /// Rebuild cached artifacts and images
    #[arg(short = 'f', long)]
    force: bool,

    /// Report host readiness without building anything
    #[arg(long)]
    doctor: bool,

    /// Emit machine readable JSON output
    #[arg(long)]
    json: bool,

    #[arg(long, hide = true)]
    root: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExecutionMode {
    Spot,
    Usdt,
}

impl ExecutionMode {
    fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Spot => "spot",
            ExecutionMode::Usdt => "usdt",
        }
    }

    fn config_file(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
enum XalgoError {
    #[error("input error: {0}")]
    Input(String),
    #[error("toolchain error: {0}")]
    Toolchain(String),
    #[error("provision error: {0}")]
    Provision(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ProcessErrorDetails {
    error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_stderr: Option<String>,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug)]
struct Context {
    root: PathBuf,
    json: bool,
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }
}

trait CommandRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error>;
}

struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        if capture_output {
            let output = cmd.output()?;
            let status_code = output
                .status
                .code()
                .unwrap_or(if output.status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

fn main() -> Result<(), XalgoError> {
    let cli = Cli::parse();
    let root = resolve_root(cli.root.as_ref());
    let root = fs::canonicalize(&root).unwrap_or(root);
    let ctx = Context {
        root,
        json: cli.json,
    };
    let runner = RealCommandRunner;

    match run(&cli, &ctx, &runner) {
        Ok(Outcome::Completed) => Ok(()),
        Ok(Outcome::Launch(plan)) => {
            announce_launch(&ctx, &plan)?;
            let err = exec_plan(&plan);
            report_failure(&ctx, &err)?;
            std::process::exit(1);
        }
        Err(err) => {
            report_failure(&ctx, &err)?;
            std::process::exit(1);
        }
    }
}

enum Outcome {
    Completed,
    Launch(LaunchPlan),
}

fn run<R: CommandRunner>(cli: &Cli, ctx: &Context, runner: &R) -> Result<Outcome, XalgoError> {
    if !ctx.root.is_dir() {
        return Err(XalgoError::Input(format!(
            "project root does not exist: {}",
            ctx.root.display()
        )));
    }
    if cli.doctor {
        handle_doctor(ctx, cli.mode, runner)?;
        return Ok(Outcome::Completed);
    }
    let choice = BackendChoice::from_flags(cli.setup, cli.docker, cli.local);
    let backend = match select_backend(choice, docker_cli_present()) {
        Some(backend) => backend,
        None => {
            handle_setup(ctx, runner)?;
            return Ok(Outcome::Completed);
        }
    };
    let plan = orchestrate(ctx, cli.mode, backend, cli.force, runner)?;
    Ok(Outcome::Launch(plan))
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendChoice {
    Auto,
    Containerized,
    Native,
    SetupOnly,
}

impl BackendChoice {
    fn from_flags(setup: bool, docker: bool, local: bool) -> Self {
        if setup {
            BackendChoice::SetupOnly
        } else if docker {
            BackendChoice::Containerized
        } else if local {
            BackendChoice::Native
        } else {
            BackendChoice::Auto
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedBackend {
    Containerized,
    Native,
}

impl ResolvedBackend {
    fn as_str(&self) -> &'static str {
        match self {
            ResolvedBackend::Containerized => "containerized",
            ResolvedBackend::Native => "native",
        }
    }
}

// Explicit flags win; auto prefers the container runtime when its CLI resolves.
fn select_backend(choice: BackendChoice, docker_present: bool) -> Option<ResolvedBackend> {
    match choice {
        BackendChoice::SetupOnly => None,
        BackendChoice::Containerized => Some(ResolvedBackend::Containerized),
        BackendChoice::Native => Some(ResolvedBackend::Native),
        BackendChoice::Auto => {
            if docker_present {
                Some(ResolvedBackend::Containerized)
            } else {
                Some(ResolvedBackend::Native)
            }
        }
    }
}

fn docker_cli_present() -> bool {
    which::which("docker").is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CondaToolchain {
    exe: PathBuf,
}

impl CondaToolchain {
    fn bin_dir(&self) -> PathBuf {
        self.exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn activated(&self, env_name: &str, env_dir: &Path) -> ActivatedToolchain {
        ActivatedToolchain {
            conda_bin_dir: self.bin_dir(),
            env_name: env_name.to_string(),
            env_dir: env_dir.to_path_buf(),
        }
    }
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

fn require_conda() -> Result<CondaToolchain, XalgoError> {
    locate_conda().ok_or_else(|| {
        XalgoError::Toolchain(format!(
            "conda not found on PATH or under ~/{{{}}}. {CONDA_INSTALL_HINT}",
            CONDA_INSTALL_DIRS.join(",")
        ))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActivatedToolchain {
    conda_bin_dir: PathBuf,
    env_name: String,
    env_dir: PathBuf,
}

impl ActivatedToolchain {
    // Child processes get the activation; this process's environment stays untouched.
    fn env_overrides(&self) -> BTreeMap<String, String> {
        let mut overrides = BTreeMap::new();
        let mut search_path = vec![self.env_dir.join("bin"), self.conda_bin_dir.clone()];
        if let Some(existing) = env::var_os("PATH") {
            search_path.extend(env::split_paths(&existing));
        }
        if let Ok(joined) = env::join_paths(search_path) {
            overrides.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
        }
        overrides.insert("CONDA_PREFIX".to_string(), self.env_dir.display().to_string());
        overrides.insert("CONDA_DEFAULT_ENV".to_string(), self.env_name.clone());
        overrides
    }
}

#[derive(Debug, Deserialize)]
struct EnvironmentFile {
    name: String,
    #[serde(default)]
    dependencies: Vec<serde_yaml::Value>,
}

#[derive(Debug, Clone)]
struct EnvironmentSpec {
    name: String,
    packages: Vec<String>,
    declaration: PathBuf,
}

impl EnvironmentSpec {
    fn load(root: &Path) -> Result<Self, XalgoError> {
        let declaration = root.join(ENV_DECLARATION);
        if !declaration.is_file() {
            return Ok(EnvironmentSpec {
                name: DEFAULT_ENV_NAME.to_string(),
                packages: Vec::new(),
                declaration,
            });
        }
        let raw = fs::read_to_string(&declaration)?;
        let file: EnvironmentFile = serde_yaml::from_str(&raw)?;
        // Nested entries (a pip mapping, say) are conda's business, not ours.
        let packages = file
            .dependencies
            .iter()
            .filter_map(|dep| dep.as_str().map(str::to_string))
            .collect();
        Ok(EnvironmentSpec {
            name: file.name,
            packages,
            declaration,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CondaEnvList {
    #[serde(default)]
    envs: Vec<PathBuf>,
}

fn conda_env_dirs<R: CommandRunner>(
    ctx: &Context,
    toolchain: &CondaToolchain,
    runner: &R,
) -> Result<Vec<PathBuf>, XalgoError> {
    let output = execute(
        runner,
        &toolchain.exe,
        &strings(&["env", "list", "--json"]),
        &ctx.root,
        &BTreeMap::new(),
        true,
        "conda_env_list_failed",
    )?;
    let parsed: CondaEnvList = serde_json::from_slice(&output.stdout)?;
    Ok(parsed.envs)
}

fn find_env_dir(envs: &[PathBuf], name: &str) -> Option<PathBuf> {
    envs.iter()
        .find(|dir| dir.file_name().map(|last| last == name).unwrap_or(false))
        .cloned()
}

#[derive(Debug, Clone)]
struct EnvReport {
    env_dir: PathBuf,
    created: bool,
    recreated: bool,
}

fn ensure_env<R: CommandRunner>(
    ctx: &Context,
    toolchain: &CondaToolchain,
    spec: &EnvironmentSpec,
    recreate: bool,
    runner: &R,
) -> Result<EnvReport, XalgoError> {
    let envs = conda_env_dirs(ctx, toolchain, runner)?;
    let existing = find_env_dir(&envs, &spec.name);
    let had_existing = existing.is_some();
    if let Some(env_dir) = existing {
        if !recreate {
            note(
                ctx,
                &format!("Environment '{}' already exists; reusing it", spec.name),
            );
            return Ok(EnvReport {
                env_dir,
                created: false,
                recreated: false,
            });
        }
        // The declaration must be readable before anything gets destroyed.
        require_declaration(spec)?;
        note(ctx, &format!("Removing environment '{}'", spec.name));
        execute(
            runner,
            &toolchain.exe,
            &strings(&["env", "remove", "-n", spec.name.as_str(), "-y"]),
            &ctx.root,
            &BTreeMap::new(),
            false,
            "conda_env_remove_failed",
        )?;
    } else {
        require_declaration(spec)?;
    }
    note(
        ctx,
        &format!("Creating environment '{}' from {ENV_DECLARATION}", spec.name),
    );
    execute(
        runner,
        &toolchain.exe,
        &strings(&["env", "create", "-f", ENV_DECLARATION]),
        &ctx.root,
        &BTreeMap::new(),
        false,
        "conda_env_create_failed",
    )?;
    let envs = conda_env_dirs(ctx, toolchain, runner)?;
    let env_dir = find_env_dir(&envs, &spec.name).ok_or_else(|| {
        XalgoError::Provision(format!(
            "environment '{}' is not listed after creation",
            spec.name
        ))
    })?;
    Ok(EnvReport {
        env_dir,
        created: true,
        recreated: had_existing,
    })
}

fn require_declaration(spec: &EnvironmentSpec) -> Result<(), XalgoError> {
    if spec.declaration.is_file() {
        return Ok(());
    }
    Err(XalgoError::Input(format!(
        "environment declaration not found: {}",
        spec.declaration.display()
    )))
}

fn confirm_recreate(name: &str) -> Result<bool, XalgoError> {
    // An existing environment is never destroyed without an interactive yes.
    if !io::stdin().is_terminal() {
        return Ok(false);
    }
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Environment '{name}' already exists. Remove and recreate it?"
        ))
        .default(false)
        .interact()?;
    Ok(confirmed)
}

fn handle_setup<R: CommandRunner>(ctx: &Context, runner: &R) -> Result<(), XalgoError> {
    let toolchain = require_conda()?;
    let spec = EnvironmentSpec::load(&ctx.root)?;
    let envs = conda_env_dirs(ctx, &toolchain, runner)?;
    let recreate = find_env_dir(&envs, &spec.name).is_some() && confirm_recreate(&spec.name)?;
    let report = ensure_env(ctx, &toolchain, &spec, recreate, runner)?;
    output(
        ctx,
        json!({
            "environment": spec.name,
            "env_dir": report.env_dir,
            "created": report.created,
            "recreated": report.recreated,
            "reused": !report.created,
            "packages": spec.packages.len(),
        }),
    )
}

fn preflight_required_files(root: &Path, mode: ExecutionMode) -> Result<(), XalgoError> {
    for name in [mode.config_file(), CREDENTIAL_FILE.to_string()] {
        let path = root.join(&name);
        if !path.is_file() {
            return Err(XalgoError::Input(format!(
                "missing required file: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

fn orchestrate<R: CommandRunner>(
    ctx: &Context,
    mode: ExecutionMode,
    backend: ResolvedBackend,
    force: bool,
    runner: &R,
) -> Result<LaunchPlan, XalgoError> {
    // Every required input file is checked before the first child process starts.
    preflight_required_files(&ctx.root, mode)?;
    match backend {
        ResolvedBackend::Native => {
            let toolchain = require_conda()?;
            native_pipeline(ctx, mode, force, &toolchain, runner)
        }
        ResolvedBackend::Containerized => container_pipeline(ctx, mode, force, runner),
    }
}

fn native_pipeline<R: CommandRunner>(
    ctx: &Context,
    mode: ExecutionMode,
    force: bool,
    toolchain: &CondaToolchain,
    runner: &R,
) -> Result<LaunchPlan, XalgoError> {
    let spec = EnvironmentSpec::load(&ctx.root)?;
    let report = ensure_env(ctx, toolchain, &spec, false, runner)?;
    let active = toolchain.activated(&spec.name, &report.env_dir);
    build_native_binary(ctx, mode, force, &active, runner)?;
    build_extension(ctx, force, &active, runner)?;
    Ok(native_launch_plan(&ctx.root, mode, &active))
}

fn container_pipeline<R: CommandRunner>(
    ctx: &Context,
    mode: ExecutionMode,
    force: bool,
    runner: &R,
) -> Result<LaunchPlan, XalgoError> {
    ensure_image(ctx, force, runner)?;
    container_build(ctx, mode, runner)?;
    Ok(container_launch_plan(&ctx.root, mode))
}

fn native_artifact_path(root: &Path, mode: ExecutionMode) -> PathBuf {
    root.join("target").join("release").join(mode.as_str())
}

fn extension_artifact_dir(root: &Path) -> PathBuf {
    root.join("pyalgo").join("target").join("release")
}

fn build_native_binary<R: CommandRunner>(
    ctx: &Context,
    mode: ExecutionMode,
    force: bool,
    active: &ActivatedToolchain,
    runner: &R,
) -> Result<(), XalgoError> {
    let artifact = native_artifact_path(&ctx.root, mode);
    if artifact.exists() {
        if !force {
            note(
                ctx,
                &format!("Using cached binary {} (rebuild with -f)", artifact.display()),
            );
            return Ok(());
        }
        // A stale artifact that cannot be removed gets rebuilt over.
        let _ = fs::remove_file(&artifact);
    }
    note(ctx, &format!("Compiling {} (release)", mode.as_str()));
    execute(
        runner,
        Path::new("cargo"),
        &strings(&["build", "--release", "--bin", mode.as_str()]),
        &ctx.root,
        &active.env_overrides(),
        false,
        "native_compile_failed",
    )?;
    Ok(())
}

fn build_extension<R: CommandRunner>(
    ctx: &Context,
    force: bool,
    active: &ActivatedToolchain,
    runner: &R,
) -> Result<(), XalgoError> {
    let artifact_dir = extension_artifact_dir(&ctx.root);
    if artifact_dir.exists() {
        if !force {
            note(
                ctx,
                &format!(
                    "Using cached extension build {} (rebuild with -f)",
                    artifact_dir.display()
                ),
            );
            return Ok(());
        }
        let _ = fs::remove_dir_all(&artifact_dir);
    }
    note(ctx, "Building the pyalgo extension (maturin develop)");
    execute(
        runner,
        Path::new("maturin"),
        &strings(&["develop", "--release", "-m", EXTENSION_MANIFEST]),
        &ctx.root,
        &active.env_overrides(),
        false,
        "extension_build_failed",
    )?;
    Ok(())
}

fn image_exists<R: CommandRunner>(ctx: &Context, runner: &R) -> Result<bool, XalgoError> {
    let args = strings(&["image", "inspect", IMAGE_NAME]);
    let command = render_command(Path::new("docker"), &args);
    let output = runner
        .run(Path::new("docker"), &args, &ctx.root, &BTreeMap::new(), true)
        .map_err(|err| spawn_failure(Path::new("docker"), &err, &command))?;
    Ok(output.success())
}

fn ensure_image<R: CommandRunner>(ctx: &Context, force: bool, runner: &R) -> Result<(), XalgoError> {
    let present = image_exists(ctx, runner)?;
    if present && !force {
        note(
            ctx,
            &format!("Image '{IMAGE_NAME}' already built (rebuild with -f)"),
        );
        return Ok(());
    }
    // The definition must exist before the old image gets destroyed.
    let dockerfile = ctx.root.join("Dockerfile");
    if !dockerfile.is_file() {
        return Err(XalgoError::Input(format!(
            "missing image definition: {}",
            dockerfile.display()
        )));
    }
    if present {
        // Removal failure is tolerated; the rebuild overwrites the tag anyway.
        let removed = runner
            .run(
                Path::new("docker"),
                &strings(&["image", "rm", IMAGE_NAME]),
                &ctx.root,
                &BTreeMap::new(),
                true,
            )
            .map(|output| output.success())
            .unwrap_or(false);
        if !removed {
            note(
                ctx,
                &format!("Could not remove image '{IMAGE_NAME}'; rebuilding over it"),
            );
        }
    }
    note(ctx, &format!("Building image '{IMAGE_NAME}'"));
    execute(
        runner,
        Path::new("docker"),
        &strings(&["build", "-t", IMAGE_NAME, "."]),
        &ctx.root,
        &BTreeMap::new(),
        false,
        "image_build_failed",
    )?;
    Ok(())
}

fn container_mount_args(root: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        format!("{}:{CONTAINER_ROOT}", root.display()),
        "-v".to_string(),
        format!("{REGISTRY_VOLUME}:{CARGO_REGISTRY_MOUNT}"),
        "-v".to_string(),
        format!("{TARGET_VOLUME}:{CONTAINER_ROOT}/target"),
        "-w".to_string(),
        CONTAINER_ROOT.to_string(),
    ]
}

fn one_shot_container_args(root: &Path, command: &[String]) -> Vec<String> {
    let mut args = strings(&["run", "--rm"]);
    args.extend(container_mount_args(root));
    args.push(IMAGE_NAME.to_string());
    args.extend(command.iter().cloned());
    args
}

fn container_build<R: CommandRunner>(
    ctx: &Context,
    mode: ExecutionMode,
    runner: &R,
) -> Result<(), XalgoError> {
    // The named target volume is the compile cache; these builds always run
    // and are cheap when the cache is warm.
    note(ctx, &format!("Compiling {} in a build container", mode.as_str()));
    execute(
        runner,
        Path::new("docker"),
        &one_shot_container_args(
            &ctx.root,
            &strings(&["cargo", "build", "--release", "--bin", mode.as_str()]),
        ),
        &ctx.root,
        &BTreeMap::new(),
        false,
        "native_compile_failed",
    )?;
    note(ctx, "Building the pyalgo extension in a build container");
    execute(
        runner,
        Path::new("docker"),
        &one_shot_container_args(
            &ctx.root,
            &strings(&["maturin", "develop", "--release", "-m", EXTENSION_MANIFEST]),
        ),
        &ctx.root,
        &BTreeMap::new(),
        false,
        "extension_build_failed",
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
struct LaunchPlan {
    mode: ExecutionMode,
    backend: ResolvedBackend,
    program: PathBuf,
    args: Vec<String>,
    cwd: PathBuf,
    env_overrides: BTreeMap<String, String>,
    port: u16,
}

fn service_args(mode: ExecutionMode) -> Vec<String> {
    vec![
        format!("-c={}", mode.config_file()),
        format!("-l={SERVICE_LOG_LEVEL}"),
    ]
}

fn native_launch_plan(root: &Path, mode: ExecutionMode, active: &ActivatedToolchain) -> LaunchPlan {
    LaunchPlan {
        mode,
        backend: ResolvedBackend::Native,
        program: native_artifact_path(root, mode),
        args: service_args(mode),
        cwd: root.to_path_buf(),
        env_overrides: active.env_overrides(),
        port: SERVICE_PORT,
    }
}

fn container_launch_plan(root: &Path, mode: ExecutionMode) -> LaunchPlan {
    let mut args = strings(&["run", "--rm", "-p"]);
    args.push(format!("{SERVICE_PORT}:{SERVICE_PORT}"));
    args.extend(container_mount_args(root));
    args.push(IMAGE_NAME.to_string());
    args.push(format!("./target/release/{}", mode.as_str()));
    args.extend(service_args(mode));
    LaunchPlan {
        mode,
        backend: ResolvedBackend::Containerized,
        program: PathBuf::from("docker"),
        args,
        cwd: root.to_path_buf(),
        env_overrides: BTreeMap::new(),
        port: SERVICE_PORT,
    }
}

fn announce_launch(ctx: &Context, plan: &LaunchPlan) -> Result<(), XalgoError> {
    if ctx.json {
        let payload = JsonResult {
            ok: true,
            result: Some(json!({
                "action": "launch",
                "mode": plan.mode.as_str(),
                "backend": plan.backend.as_str(),
                "command": render_command(&plan.program, &plan.args),
                "port": plan.port,
            })),
            error: None,
            error_details: None,
        };
        print_json(&payload)?;
    } else {
        println!(
            "Starting the {} service on port {} ({} backend)",
            plan.mode,
            plan.port,
            plan.backend.as_str()
        );
    }
    io::stdout().flush()?;
    Ok(())
}

#[cfg(unix)]
fn exec_plan(plan: &LaunchPlan) -> XalgoError {
    use std::os::unix::process::CommandExt;

    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args).current_dir(&plan.cwd);
    for (key, value) in &plan.env_overrides {
        cmd.env(key, value);
    }
    // exec only returns on failure.
    let err = cmd.exec();
    let command = render_command(&plan.program, &plan.args);
    let details = spawn_error_details(&plan.program, &err, &command);
    XalgoError::ProcessDetailed {
        message: spawn_failure_message(&command, &err, &details),
        details,
    }
}

#[cfg(not(unix))]
fn exec_plan(plan: &LaunchPlan) -> XalgoError {
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args).current_dir(&plan.cwd);
    for (key, value) in &plan.env_overrides {
        cmd.env(key, value);
    }
    match cmd.status() {
        Ok(status) => {
            let code = status.code().unwrap_or(if status.success() { 0 } else { 1 });
            std::process::exit(code);
        }
        Err(err) => {
            let command = render_command(&plan.program, &plan.args);
            let details = spawn_error_details(&plan.program, &err, &command);
            XalgoError::ProcessDetailed {
                message: spawn_failure_message(&command, &err, &details),
                details,
            }
        }
    }
}

fn execute<R: CommandRunner>(
    runner: &R,
    program: &Path,
    args: &[String],
    cwd: &Path,
    env_overrides: &BTreeMap<String, String>,
    capture_output: bool,
    failure_code: &str,
) -> Result<CommandOutput, XalgoError> {
    let command = render_command(program, args);
    let output = runner
        .run(program, args, cwd, env_overrides, capture_output)
        .map_err(|err| spawn_failure(program, &err, &command))?;
    if !output.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let (error_code, hint) = classify_command_failure(program, &stderr, failure_code);
        let mut message = format!(
            "command failed with status {} while running `{command}`",
            output.status_code
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        if let Some(hint_message) = &hint {
            message = format!("{message}\nHint: {hint_message}");
        }
        return Err(XalgoError::ProcessDetailed {
            message,
            details: ProcessErrorDetails {
                error_code,
                hint,
                command: Some(command),
                raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
            },
        });
    }
    Ok(output)
}

fn classify_command_failure(
    program: &Path,
    stderr: &str,
    fallback_code: &str,
) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();
    if program_name(program) == "docker" {
        if lower.contains("cannot connect to the docker daemon")
            || lower.contains("is the docker daemon running")
            || lower.contains("error during connect")
        {
            return (
                "docker_daemon_unreachable".to_string(),
                Some("The Docker daemon is not reachable. Start Docker and retry.".to_string()),
            );
        }
        if lower.contains("port is already allocated") || lower.contains("address already in use") {
            return (
                "docker_port_conflict".to_string(),
                Some(format!(
                    "Port {SERVICE_PORT} is already in use. Stop whatever holds it and retry."
                )),
            );
        }
        if lower.contains("pull access denied")
            || lower.contains("unauthorized")
            || lower.contains("authentication required")
        {
            return (
                "docker_registry_auth".to_string(),
                Some("Registry authentication failed. Run `docker login` and retry.".to_string()),
            );
        }
    }
    (fallback_code.to_string(), None)
}

fn spawn_failure(program: &Path, err: &io::Error, command: &str) -> XalgoError {
    let details = spawn_error_details(program, err, command);
    XalgoError::ProcessDetailed {
        message: spawn_failure_message(command, err, &details),
        details,
    }
}

fn spawn_failure_message(command: &str, err: &io::Error, details: &ProcessErrorDetails) -> String {
    let mut message = format!("failed to run command `{command}`: {err}");
    if let Some(hint) = &details.hint {
        message = format!("{message}\nHint: {hint}");
    }
    message
}

fn spawn_error_details(program: &Path, err: &io::Error, command: &str) -> ProcessErrorDetails {
    let (error_code, hint) = if err.kind() == io::ErrorKind::NotFound {
        match program_name(program).as_str() {
            "docker" => (
                "docker_not_found",
                Some("Install Docker and ensure `docker` is on your PATH."),
            ),
            "conda" => ("conda_not_found", Some(CONDA_INSTALL_HINT)),
            "cargo" => (
                "cargo_not_found",
                Some("The active environment does not provide cargo; add rust to environment.yml and re-run `xalgo --setup`."),
            ),
            "maturin" => (
                "maturin_not_found",
                Some("The active environment does not provide maturin; add maturin to environment.yml and re-run `xalgo --setup`."),
            ),
            "python" => (
                "python_not_found",
                Some("The active environment does not provide python; re-run `xalgo --setup`."),
            ),
            _ => ("process_spawn_failed", None),
        }
    } else {
        ("process_spawn_failed", None)
    };
    ProcessErrorDetails {
        error_code: error_code.to_string(),
        hint: hint.map(str::to_string),
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

fn program_name(program: &Path) -> String {
    program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn render_command(program: &Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(&program.to_string_lossy()));
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn shell_quote(part: &str) -> String {
    if part.is_empty() {
        return "''".to_string();
    }
    let safe = part
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || "-_./=:@%+,".contains(ch));
    if safe {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', "'\\''"))
    }
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    severity: String,
    message: String,
    remediation: String,
}

fn doctor_check(
    id: &str,
    ok: bool,
    severity: &str,
    message: String,
    remediation: &str,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        message,
        remediation: remediation.to_string(),
    }
}

fn collect_doctor_checks<R: CommandRunner>(
    ctx: &Context,
    mode: ExecutionMode,
    runner: &R,
) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();

    let conda = locate_conda();
    checks.push(doctor_check(
        "conda",
        conda.is_some(),
        "warning",
        match &conda {
            Some(toolchain) => format!("conda found at {}", toolchain.exe.display()),
            None => "conda not found".to_string(),
        },
        CONDA_INSTALL_HINT,
    ));

    let docker = docker_cli_present();
    checks.push(doctor_check(
        "docker",
        docker,
        "warning",
        if docker {
            "docker CLI found".to_string()
        } else {
            "docker CLI not found".to_string()
        },
        "Install Docker and ensure `docker` is on your PATH.",
    ));

    checks.push(doctor_check(
        "backend",
        conda.is_some() || docker,
        "error",
        if conda.is_some() || docker {
            "at least one build backend is available".to_string()
        } else {
            "no usable backend: neither conda nor docker is available".to_string()
        },
        "Install Miniconda or Docker; either one unblocks builds.",
    ));

    match EnvironmentSpec::load(&ctx.root) {
        Ok(spec) => {
            let declared = spec.declaration.is_file();
            checks.push(doctor_check(
                "environment-declaration",
                declared,
                "warning",
                if declared {
                    format!(
                        "environment '{}' declares {} packages",
                        spec.name,
                        spec.packages.len()
                    )
                } else {
                    format!("{} not found", spec.declaration.display())
                },
                "Create environment.yml at the project root.",
            ));
            if let Some(toolchain) = &conda {
                let (ok, message) = match conda_env_dirs(ctx, toolchain, runner) {
                    Ok(envs) => {
                        if find_env_dir(&envs, &spec.name).is_some() {
                            (true, format!("environment '{}' is provisioned", spec.name))
                        } else {
                            (false, format!("environment '{}' is not provisioned", spec.name))
                        }
                    }
                    Err(err) => (false, format!("could not query environments: {err}")),
                };
                checks.push(doctor_check(
                    "conda-environment",
                    ok,
                    "warning",
                    message,
                    "Run `xalgo --setup`.",
                ));
            }
        }
        Err(err) => {
            checks.push(doctor_check(
                "environment-declaration",
                false,
                "warning",
                format!("could not parse {ENV_DECLARATION}: {err}"),
                "Fix the YAML in environment.yml.",
            ));
        }
    }

    let config = ctx.root.join(mode.config_file());
    let config_present = config.is_file();
    checks.push(doctor_check(
        "mode-config",
        config_present,
        "warning",
        if config_present {
            format!("{} present", config.display())
        } else {
            format!("{} missing", config.display())
        },
        "Create the mode config next to environment.yml.",
    ));

    let credential = ctx.root.join(CREDENTIAL_FILE);
    let credential_present = credential.is_file();
    checks.push(doctor_check(
        "credential",
        credential_present,
        "warning",
        if credential_present {
            format!("{} present", credential.display())
        } else {
            format!("{} missing", credential.display())
        },
        "Place the service credential at the project root.",
    ));

    if docker {
        let (ok, message) = match image_exists(ctx, runner) {
            Ok(true) => (true, format!("image '{IMAGE_NAME}' is built")),
            Ok(false) => (false, format!("image '{IMAGE_NAME}' is not built")),
            Err(err) => (false, format!("could not inspect image: {err}")),
        };
        checks.push(doctor_check(
            "image",
            ok,
            "warning",
            message,
            "Run `xalgo --docker` to build it.",
        ));
    }

    checks
}

fn handle_doctor<R: CommandRunner>(
    ctx: &Context,
    mode: ExecutionMode,
    runner: &R,
) -> Result<(), XalgoError> {
    let checks = collect_doctor_checks(ctx, mode, runner);
    let blocked = checks
        .iter()
        .any(|check| !check.ok && check.severity == "error");

    if ctx.json {
        let payload = JsonResult {
            ok: !blocked,
            result: Some(json!({ "checks": checks })),
            error: if blocked {
                Some("doctor found blocking problems".to_string())
            } else {
                None
            },
            error_details: None,
        };
        print_json(&payload)?;
    } else {
        for check in &checks {
            let state = if check.ok { "ok" } else { "fail" };
            println!(
                "[{state}] {} ({}) - {}",
                check.id, check.severity, check.message
            );
            if !check.ok && !check.remediation.is_empty() {
                println!("       remediation: {}", check.remediation);
            }
        }
    }
    if !blocked {
        return Ok(());
    }
    if !ctx.json {
        eprintln!("doctor found blocking problems");
    }
    std::process::exit(1);
}

fn note(ctx: &Context, message: &str) {
    if !ctx.json {
        println!("{message}");
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), XalgoError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{payload}");
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), XalgoError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{text}");
    Ok(())
}

fn report_failure(ctx: &Context, err: &XalgoError) -> Result<(), XalgoError> {
    if ctx.json {
        let payload = JsonResult::<serde_json::Value> {
            ok: false,
            result: None,
            error: Some(err.to_string()),
            error_details: extract_process_error_details(err),
        };
        print_json(&payload)?;
    } else {
        eprintln!("{err}");
    }
    Ok(())
}

fn extract_process_error_details(err: &XalgoError) -> Option<ProcessErrorDetails> {
    match err {
        XalgoError::ProcessDetailed { details, .. } => Some(details.clone()),
        _ => None,
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}
