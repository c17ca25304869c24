use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use foreman_core::{CoreError, Project, TicketId};

pub const WORKTREE_DIR: &str = ".foreman/worktrees";
pub const BRANCH_PREFIX: &str = "foreman/";

pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<std::process::Output>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<std::process::Output> {
        std::process::Command::new(program).args(args).output()
    }
}

/// A resolved working directory for one agent run. `isolated` is false when
/// the main checkout is used directly, either because the project is not
/// under source control or because worktree provisioning fell back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub isolated: bool,
}

pub trait WorkspaceProvider: Send + Sync {
    fn provision(&self, project: &Project, ticket_id: &TicketId) -> Result<Workspace, CoreError>;
}

pub struct WorkspaceManager<R: CommandRunner> {
    runner: R,
    git_binary: PathBuf,
    workspace_root: PathBuf,
}

impl<R: CommandRunner> WorkspaceManager<R> {
    pub fn new(runner: R, git_binary: PathBuf, workspace_root: PathBuf) -> Self {
        Self {
            runner,
            git_binary,
            workspace_root,
        }
    }

    fn resolve_checkout(&self, project: &Project) -> PathBuf {
        match &project.repo_path {
            Some(path) => path.clone(),
            None => self.workspace_root.join(&project.name),
        }
    }

    fn run_git(&self, args: &[OsString]) -> Result<std::process::Output, CoreError> {
        let program = self.git_binary.to_str().ok_or_else(|| {
            CoreError::Configuration("Invalid git binary path".to_owned())
        })?;
        let output = self
            .runner
            .run(program, args)
            .map_err(|error| match error.kind() {
                io::ErrorKind::NotFound => CoreError::DependencyUnavailable(format!(
                    "Git CLI `{}` was not found. Install Git or configure a valid binary path.",
                    self.git_binary.display()
                )),
                _ => CoreError::DependencyUnavailable(format!(
                    "Failed to execute Git CLI `{}`: {error}",
                    self.git_binary.display()
                )),
            })?;
        if output.status.success() {
            return Ok(output);
        }
        Err(self.command_failed(args, &output))
    }

    fn command_failed(&self, args: &[OsString], output: &std::process::Output) -> CoreError {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        let detail = if !stderr.is_empty() {
            stderr
        } else if !stdout.is_empty() {
            stdout
        } else {
            format!("exit status {}", output.status)
        };
        let rendered_args = args
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(" ");

        CoreError::Workspace(format!(
            "Git command failed (`{} {rendered_args}`): {detail}",
            self.git_binary.display()
        ))
    }

    fn create_branch_args(checkout: &Path, branch: &str) -> Vec<OsString> {
        vec![
            OsString::from("-C"),
            checkout.as_os_str().to_owned(),
            OsString::from("branch"),
            OsString::from(branch),
        ]
    }

    fn attach_worktree_args(checkout: &Path, worktree_path: &Path, branch: &str) -> Vec<OsString> {
        vec![
            OsString::from("-C"),
            checkout.as_os_str().to_owned(),
            OsString::from("worktree"),
            OsString::from("add"),
            worktree_path.as_os_str().to_owned(),
            OsString::from(branch),
        ]
    }

    fn is_branch_already_exists_error(error: &CoreError) -> bool {
        error.to_string().to_ascii_lowercase().contains("already exists")
    }

    fn attach_worktree(
        &self,
        checkout: &Path,
        worktree_path: &Path,
        branch: &str,
    ) -> Result<(), CoreError> {
        let parent = worktree_path.parent().ok_or_else(|| {
            CoreError::Workspace(format!(
                "Worktree path '{}' has no parent directory.",
                worktree_path.display()
            ))
        })?;
        fs::create_dir_all(parent).map_err(|error| {
            CoreError::Workspace(format!(
                "Failed to create worktree parent directory '{}': {error}",
                parent.display()
            ))
        })?;

        match self.run_git(&Self::create_branch_args(checkout, branch)) {
            Ok(_) => {}
            Err(error) if Self::is_branch_already_exists_error(&error) => {}
            Err(error) => return Err(error),
        }

        self.run_git(&Self::attach_worktree_args(checkout, worktree_path, branch))?;
        Ok(())
    }
}

impl<R: CommandRunner> WorkspaceProvider for WorkspaceManager<R> {
    /// Provisioning is idempotent: the workspace id is derived from the
    /// ticket id, and an existing worktree is reused without touching git.
    /// Isolation is best-effort; branch or worktree failures fall back to
    /// the main checkout instead of failing the dispatch.
    fn provision(&self, project: &Project, ticket_id: &TicketId) -> Result<Workspace, CoreError> {
        let checkout = self.resolve_checkout(project);
        if !checkout.exists() {
            return Err(CoreError::Workspace(format!(
                "Project '{}' checkout '{}' does not exist.",
                project.name,
                checkout.display()
            )));
        }

        if !checkout.join(".git").exists() {
            return Ok(Workspace {
                path: checkout,
                branch: None,
                isolated: false,
            });
        }

        let slug = workspace_slug(ticket_id);
        let worktree_path = checkout.join(WORKTREE_DIR).join(&slug);
        let branch = format!("{BRANCH_PREFIX}{slug}");

        if worktree_path.exists() {
            return Ok(Workspace {
                path: worktree_path,
                branch: Some(branch),
                isolated: true,
            });
        }

        match self.attach_worktree(&checkout, &worktree_path, &branch) {
            Ok(()) => Ok(Workspace {
                path: worktree_path,
                branch: Some(branch),
                isolated: true,
            }),
            Err(error) => {
                tracing::warn!(
                    ticket = ticket_id.as_str(),
                    error = %error,
                    "worktree provisioning failed, falling back to the main checkout"
                );
                Ok(Workspace {
                    path: checkout,
                    branch: None,
                    isolated: false,
                })
            }
        }
    }
}

/// Deterministic workspace id for a ticket: lowercase, non-alphanumerics
/// collapsed to single hyphens.
pub fn workspace_slug(ticket_id: &TicketId) -> String {
    let mut slug = String::from("ticket-");
    let mut previous_was_dash = false;
    for ch in ticket_id.as_str().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            previous_was_dash = false;
        } else if !previous_was_dash {
            slug.push('-');
            previous_was_dash = true;
        }
    }
    slug.trim_end_matches('-').to_owned()
}
