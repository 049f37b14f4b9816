use std::{
    path::PathBuf,
    process::{Command, Stdio},
};

use crate::{
    measure::Measure,
    provider::{Provider, ProviderError, ProviderId},
    result::Results,
};

/// State of the Git repository containing the working directory, read through the
/// `git` command line.
#[derive(Debug)]
pub struct GitProvider {
    dir: Option<PathBuf>,
    program: PathBuf,
}

impl Default for GitProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl GitProvider {
    /// Inspects the repository at `dir`, or around the current directory if `None`.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            program: PathBuf::from("git"),
        }
    }

    #[cfg(test)]
    fn with_program(dir: Option<PathBuf>, program: impl Into<PathBuf>) -> Self {
        Self {
            dir,
            program: program.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        cmd.args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    /// Runs `git <args>` and returns its trimmed standard output.
    fn git(&self, args: &[&str]) -> Result<String, ProviderError> {
        let output = self.command(args).output()?;
        if !output.status.success() {
            return Err(ProviderError::Unavailable(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether the directory is inside a work tree. Fails only if git cannot be run.
    fn is_repo(&self) -> Result<bool, ProviderError> {
        let output = self.command(&["rev-parse", "--is-inside-work-tree"]).output()?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    fn non_empty(&self, args: &[&str]) -> Result<String, ProviderError> {
        let out = self.git(args)?;
        if out.is_empty() {
            return Err(ProviderError::Unavailable(format!("git {} is empty", args.join(" "))));
        }
        Ok(out)
    }

    fn tags(&self) -> Result<String, ProviderError> {
        let out = self.git(&["tag", "--points-at", "HEAD"])?;
        let tags: Vec<&str> = out.lines().map(str::trim).filter(|t| !t.is_empty()).collect();
        serde_json::to_string(&tags).map_err(|e| ProviderError::Unavailable(e.to_string()))
    }

    fn unpushed(&self) -> Result<bool, ProviderError> {
        let count = self.git(&["rev-list", "--count", "@{u}..HEAD"])?;
        let count: u64 = count.parse().map_err(|_| ProviderError::Parse {
            what: "unpushed commit count",
            raw: count,
        })?;
        Ok(count > 0)
    }
}

impl Provider for GitProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Git
    }

    fn fetch(&self, measures: &[Measure]) -> Results {
        let mut results = Results::new();
        let is_repo = match self.is_repo() {
            Ok(is_repo) => is_repo,
            Err(e) => {
                log::warn!("cannot run {}, omitting git measures: {e}", self.program.display());
                return results;
            }
        };
        if measures.contains(&Measure::GitIsRepo) {
            results.insert(Measure::GitIsRepo, is_repo);
        }
        if !is_repo {
            log::debug!("not inside a git repository, skipping git measures");
            return results;
        }

        for measure in measures {
            match measure {
                Measure::GitHash => {
                    results.record(*measure, self.non_empty(&["rev-parse", "HEAD^{tree}"]))
                }
                Measure::GitLastCommitHash => {
                    results.record(*measure, self.non_empty(&["rev-parse", "HEAD"]))
                }
                Measure::GitBranch => results.record(
                    *measure,
                    self.non_empty(&["rev-parse", "--abbrev-ref", "HEAD"]),
                ),
                Measure::GitBranchUpstream => results.record(
                    *measure,
                    self.non_empty(&["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"]),
                ),
                Measure::GitTags => results.record(*measure, self.tags()),
                Measure::GitRemoteOrigin => {
                    results.record(*measure, self.non_empty(&["remote", "get-url", "origin"]))
                }
                Measure::GitUncommittedChanges => results.record(
                    *measure,
                    self.git(&["status", "--porcelain", "--untracked-files=no"])
                        .map(|out| !out.is_empty()),
                ),
                Measure::GitUnpushedChanges => results.record(*measure, self.unpushed()),
                Measure::GitUncheckedFiles => results.record(
                    *measure,
                    self.git(&["ls-files", "--others", "--exclude-standard"])
                        .map(|out| !out.is_empty()),
                ),
                _ => {}
            }
        }
        results
    }
}
