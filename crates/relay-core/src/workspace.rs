//! Workspace allocation
//!
//! Creating git worktrees is the job of an external provider. The core asks
//! for a directory through [`WorkspaceProvider`] before a session is created
//! and never touches the filesystem layout itself, except in
//! [`DirectWorkspaceProvider`] which hands out plain directories.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::session::{IssueContext, SessionType, Workspace};

/// What the engine knows when it asks for a workspace
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceRequest<'a> {
    pub session_id: &'a str,
    pub thread_key: &'a str,
    pub session_type: SessionType,
    pub repository: Option<&'a RepositoryConfig>,
    pub issue_context: Option<&'a IssueContext>,
}

#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn allocate(&self, request: WorkspaceRequest<'_>) -> Result<Workspace>;
}

/// Hands every session a directory of its own
///
/// Repository sessions get `<workspace_base_dir>/<session>`, falling back to
/// `<scratch_root>/<repository id>/<session>`; other sessions get
/// `<scratch_root>/<session>`. Two live backends never share a directory, so
/// the checkout itself is never handed out.
pub struct DirectWorkspaceProvider {
    scratch_root: PathBuf,
}

impl DirectWorkspaceProvider {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
        }
    }

    fn session_dir(&self, request: &WorkspaceRequest<'_>) -> PathBuf {
        let root = match request.repository {
            Some(repository) => repository
                .workspace_base_dir
                .clone()
                .unwrap_or_else(|| self.scratch_root.join(sanitize(&repository.id))),
            None => self.scratch_root.clone(),
        };
        root.join(sanitize(request.session_id))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[async_trait]
impl WorkspaceProvider for DirectWorkspaceProvider {
    async fn allocate(&self, request: WorkspaceRequest<'_>) -> Result<Workspace> {
        let path = self.session_dir(&request);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| Error::Workspace(format!("{}: {}", path.display(), e)))?;
        Ok(Workspace::new(path))
    }
}
