use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::RunnerConfig;

/// Mount point of the uploads directory inside the scanner container.
const CONTAINER_DATA_DIR: &str = "/data";
/// Mount point of the progress directory inside the scanner container.
const CONTAINER_PROGRESS_DIR: &str = "/progress";

/// How the scanner is launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScannerMode {
    /// Program resolved from `PATH` or an explicit path.
    #[default]
    System,
    /// `docker run` against the configured image.
    Docker,
    /// Canned output without spawning anything.
    Mock,
}

impl ScannerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerMode::System => "system",
            ScannerMode::Docker => "docker",
            ScannerMode::Mock => "mock",
        }
    }
}

impl fmt::Display for ScannerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScannerMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" | "local" => Ok(ScannerMode::System),
            "docker" => Ok(ScannerMode::Docker),
            "mock" => Ok(ScannerMode::Mock),
            other => Err(format!("unknown scanner mode `{other}`")),
        }
    }
}

/// What the supervisor should do for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanInvocation {
    Process { program: PathBuf, args: Vec<String> },
    Canned { stdout: String },
}

impl ScanInvocation {
    /// Shell-like rendering for logs.
    pub fn display_command(&self) -> String {
        match self {
            ScanInvocation::Process { program, args } => {
                let mut line = program.display().to_string();
                for arg in args {
                    line.push(' ');
                    line.push_str(arg);
                }
                line
            }
            ScanInvocation::Canned { .. } => "<mock scanner>".to_string(),
        }
    }
}

pub fn build_invocation(
    config: &RunnerConfig,
    input: &Path,
    format: &str,
    progress_file: Option<&Path>,
) -> ScanInvocation {
    let progress_file = progress_file.filter(|_| config.use_progress);

    match config.mode {
        ScannerMode::Mock => ScanInvocation::Canned {
            stdout: mock_output(input),
        },
        ScannerMode::System => {
            let mut args = Vec::new();
            if let Some(file) = progress_file {
                push_progress_args(&mut args, file);
            }
            push_scan_args(&mut args, input, format);
            ScanInvocation::Process {
                program: config.program.clone(),
                args,
            }
        }
        ScannerMode::Docker => {
            let uploads = absolute(&config.uploads_dir);
            let mut args = vec![
                "run".to_string(),
                "--rm".to_string(),
                "-v".to_string(),
                format!("{}:{CONTAINER_DATA_DIR}", uploads.display()),
            ];

            let container_progress = progress_file.and_then(|file| {
                let dir = absolute(file.parent()?);
                let name = file.file_name()?;
                args.push("-v".to_string());
                args.push(format!("{}:{CONTAINER_PROGRESS_DIR}", dir.display()));
                Some(Path::new(CONTAINER_PROGRESS_DIR).join(name))
            });

            args.push(config.docker_image.clone());
            if let Some(file) = &container_progress {
                push_progress_args(&mut args, file);
            }
            push_scan_args(&mut args, &container_input(&uploads, input), format);

            ScanInvocation::Process {
                program: PathBuf::from("docker"),
                args,
            }
        }
    }
}

fn push_progress_args(args: &mut Vec<String>, file: &Path) {
    args.push("--progress".to_string());
    args.push("--progress-file".to_string());
    args.push(file.display().to_string());
}

fn push_scan_args(args: &mut Vec<String>, input: &Path, format: &str) {
    args.extend([
        "scan".to_string(),
        "--file".to_string(),
        input.display().to_string(),
        "--format".to_string(),
        format.to_string(),
    ]);
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Rewrites a host path under the uploads directory to its container path.
fn container_input(uploads: &Path, input: &Path) -> PathBuf {
    let input = absolute(input);
    match input.strip_prefix(uploads) {
        Ok(relative) => Path::new(CONTAINER_DATA_DIR).join(relative),
        Err(_) => input,
    }
}

fn mock_output(input: &Path) -> String {
    format!(
        "Analyzing binary: {}\n\
         * CVE-2021-1111: Example binary vulnerability.\n\
         No further issues found.\n",
        input.display()
    )
}
