//! Commit source backed by the `git` command line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relgraph_state::CommitHash;
use tokio::process::Command;
use tracing::debug;

use super::{CommitSource, SourceCommit};
use crate::error::VcsError;

const FIELD_SEP: char = '\u{1f}';
const LOG_FORMAT: &str = "--format=%H%x1f%P%x1f%an%x1f%aI%x1f%s";

/// Reads a local clone by shelling out to `git`.
#[derive(Debug, Clone)]
pub struct GitCliSource {
    repository: String,
    path: PathBuf,
}

impl GitCliSource {
    pub fn new(repository: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, reason: impl Into<String>) -> VcsError {
        VcsError::RepositoryUnavailable {
            repository: self.repository.clone(),
            reason: reason.into(),
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> VcsError {
        VcsError::Malformed {
            repository: self.repository.clone(),
            reason: reason.into(),
        }
    }

    async fn output(&self, args: &[String]) -> Result<std::process::Output, VcsError> {
        debug!(repository = %self.repository, ?args, "running git");
        Command::new("git")
            .arg("-C")
            .arg(&self.path)
            .args(args)
            .output()
            .await
            .map_err(|e| self.unavailable(format!("failed to run git: {e}")))
    }

    async fn run(&self, args: &[String]) -> Result<String, VcsError> {
        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.unavailable(format!(
                "git {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )));
        }
        String::from_utf8(output.stdout).map_err(|e| self.malformed(e.to_string()))
    }

    fn hash(&self, raw: &str) -> Result<CommitHash, VcsError> {
        CommitHash::parse(raw).map_err(|e| self.malformed(e.to_string()))
    }

    fn parse_log_line(&self, line: &str) -> Result<SourceCommit, VcsError> {
        let fields: Vec<&str> = line.splitn(5, FIELD_SEP).collect();
        let [hash, parents, author, date, summary] = fields.as_slice() else {
            return Err(self.malformed(format!("unexpected log line {line:?}")));
        };
        let parents = parents
            .split_whitespace()
            .map(|p| self.hash(p))
            .collect::<Result<Vec<_>, _>>()?;
        let authored_at = DateTime::parse_from_rfc3339(date)
            .map_err(|e| self.malformed(format!("bad author date {date:?}: {e}")))?
            .with_timezone(&Utc);
        Ok(SourceCommit {
            hash: self.hash(hash)?,
            parents,
            author: author.to_string(),
            authored_at,
            summary: summary.to_string(),
        })
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl CommitSource for GitCliSource {
    async fn ref_targets(&self) -> Result<BTreeMap<String, CommitHash>, VcsError> {
        let out = self
            .run(&args(&[
                "for-each-ref",
                "--format=%(objectname) %(*objectname) %(refname)",
                "refs/heads",
                "refs/tags",
            ]))
            .await?;
        let mut refs = BTreeMap::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let mut parts = line.splitn(3, ' ');
            let (Some(object), Some(peeled), Some(name)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(self.malformed(format!("unexpected ref line {line:?}")));
            };
            // annotated tags point at a tag object; use the commit it peels to
            let target = if peeled.is_empty() { object } else { peeled };
            refs.insert(name.to_string(), self.hash(target)?);
        }
        Ok(refs)
    }

    async fn commits_between(
        &self,
        include: &CommitHash,
        exclude: &[CommitHash],
        limit: usize,
    ) -> Result<Vec<SourceCommit>, VcsError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut cmd = args(&["log", "--topo-order", "--reverse", LOG_FORMAT]);
        cmd.push(include.to_string());
        if !exclude.is_empty() {
            cmd.push("--not".to_string());
            cmd.extend(exclude.iter().map(|h| h.to_string()));
        }
        // `--reverse` applies after `-n`, so the limit is taken here instead
        let out = self.run(&cmd).await?;
        out.lines()
            .filter(|l| !l.is_empty())
            .take(limit)
            .map(|l| self.parse_log_line(l))
            .collect()
    }

    async fn commit(&self, hash: &CommitHash) -> Result<Option<SourceCommit>, VcsError> {
        if !self.has_commit(hash).await? {
            return Ok(None);
        }
        let out = self
            .run(&args(&["log", "-1", LOG_FORMAT, hash.as_str()]))
            .await?;
        match out.lines().next() {
            Some(line) => self.parse_log_line(line).map(Some),
            None => Ok(None),
        }
    }

    async fn has_commit(&self, hash: &CommitHash) -> Result<bool, VcsError> {
        let output = self
            .output(&args(&["cat-file", "-e", &format!("{hash}^{{commit}}")]))
            .await?;
        Ok(output.status.success())
    }

    async fn is_ancestor(
        &self,
        ancestor: &CommitHash,
        descendant: &CommitHash,
    ) -> Result<bool, VcsError> {
        let output = self
            .output(&args(&[
                "merge-base",
                "--is-ancestor",
                ancestor.as_str(),
                descendant.as_str(),
            ]))
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.unavailable(format!(
                "git merge-base failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}
