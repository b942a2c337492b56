//! In-memory remote used by the engine and orchestrator tests. Like a real
//! WebDAV server it bumps the change tag of every ancestor collection when
//! something below it changes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use davsync_core::{DavError, StatusCode};
use tokio_util::sync::CancellationToken;

use super::paths::{ROOT, join, split};
use super::reconcile::EntryType;
use super::remote::{RemoteEntry, RemoteStore};

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, etag: String },
    Dir { etag: String },
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    counter: u64,
    failing: BTreeSet<String>,
    calls: Vec<String>,
    omit_upload_etag: bool,
    cancel_on_list: Option<(String, CancellationToken)>,
}

#[derive(Clone)]
pub(crate) struct MemoryRemote {
    state: Arc<Mutex<State>>,
    root: String,
}

impl MemoryRemote {
    pub(crate) fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert(ROOT.into(), Node::Dir { etag: "e0".into() });
        Self {
            state: Arc::new(Mutex::new(state)),
            root: String::new(),
        }
    }

    /// A view sharing the same tree whose paths are resolved below `root`.
    pub(crate) fn scoped(&self, root: &str) -> Self {
        Self {
            state: self.state.clone(),
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn mkdir(&self, path: &str) {
        let full = self.full(path);
        let mut state = self.lock();
        let etag = next_tag(&mut state);
        state.nodes.insert(full.clone(), Node::Dir { etag });
        bump_ancestors(&mut state, &full);
    }

    pub(crate) fn put_file(&self, path: &str, data: &[u8]) {
        let full = self.full(path);
        let mut state = self.lock();
        let etag = next_tag(&mut state);
        state.nodes.insert(
            full.clone(),
            Node::File {
                data: data.to_vec(),
                etag,
            },
        );
        bump_ancestors(&mut state, &full);
    }

    pub(crate) fn remove(&self, path: &str) {
        let full = self.full(path);
        let mut state = self.lock();
        remove_tree(&mut state, &full);
        bump_ancestors(&mut state, &full);
    }

    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(&self.full(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_dir(&self, path: &str) -> bool {
        matches!(self.lock().nodes.get(&self.full(path)), Some(Node::Dir { .. }))
    }

    pub(crate) fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(&self.full(path))
    }

    /// Makes every call touching `path` fail with a server error.
    pub(crate) fn fail(&self, path: &str) {
        let full = self.full(path);
        self.lock().failing.insert(full);
    }

    pub(crate) fn heal(&self) {
        self.lock().failing.clear();
    }

    /// Cancels `token` as soon as `path` is listed, mimicking a user who
    /// stops the sync while that level runs.
    pub(crate) fn cancel_on_list(&self, path: &str, token: CancellationToken) {
        let full = self.full(path);
        self.lock().cancel_on_list = Some((full, token));
    }

    pub(crate) fn omit_upload_etag(&self) {
        self.lock().omit_upload_etag = true;
    }

    /// Calls made so far as `"<OP> <path>"`, paths relative to this view.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn full(&self, path: &str) -> String {
        let path = path.trim_end_matches('/');
        match (self.root.is_empty(), path.is_empty()) {
            (true, true) => ROOT.into(),
            (true, false) => path.into(),
            (false, true) => self.root.clone(),
            (false, false) => format!("{}{}", self.root, path),
        }
    }

    fn begin(&self, op: &str, path: &str) -> Result<(MutexGuard<'_, State>, String), DavError> {
        let full = self.full(path);
        let mut state = self.lock();
        state.calls.push(format!("{op} {path}"));
        if op == "LIST"
            && let Some((target, token)) = &state.cancel_on_list
            && *target == full
        {
            token.cancel();
        }
        if state.failing.contains(&full) {
            return Err(status(StatusCode::INTERNAL_SERVER_ERROR));
        }
        Ok((state, full))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, DavError> {
        let (state, full) = self.begin("LIST", path)?;
        if !matches!(state.nodes.get(&full), Some(Node::Dir { .. })) {
            return Err(status(StatusCode::NOT_FOUND));
        }
        Ok(state
            .nodes
            .iter()
            .filter_map(|(candidate, node)| {
                let (parent, name) = split(candidate)?;
                if parent != full {
                    return None;
                }
                let (entry_type, etag) = match node {
                    Node::File { etag, .. } => (EntryType::File, etag.clone()),
                    Node::Dir { etag } => (EntryType::Directory, etag.clone()),
                };
                Some(RemoteEntry {
                    name,
                    entry_type,
                    etag: Some(etag),
                })
            })
            .collect())
    }

    async fn change_tag(&self, path: &str) -> Result<Option<String>, DavError> {
        let (state, full) = self.begin("TAG", path)?;
        Ok(state.nodes.get(&full).map(|node| match node {
            Node::File { etag, .. } | Node::Dir { etag } => etag.clone(),
        }))
    }

    async fn download(&self, path: &str, target: &Path) -> Result<(), DavError> {
        let data = {
            let (state, full) = self.begin("GET", path)?;
            match state.nodes.get(&full) {
                Some(Node::File { data, .. }) => data.clone(),
                _ => return Err(status(StatusCode::NOT_FOUND)),
            }
        };
        tokio::fs::write(target, data).await?;
        Ok(())
    }

    async fn upload(&self, source: &Path, path: &str) -> Result<Option<String>, DavError> {
        let data = tokio::fs::read(source).await?;
        let (mut state, full) = self.begin("PUT", path)?;
        require_parent(&state, &full)?;
        let etag = next_tag(&mut state);
        state.nodes.insert(
            full.clone(),
            Node::File {
                data,
                etag: etag.clone(),
            },
        );
        bump_ancestors(&mut state, &full);
        Ok((!state.omit_upload_etag).then_some(etag))
    }

    async fn create_directory(&self, path: &str) -> Result<(), DavError> {
        let (mut state, full) = self.begin("MKCOL", path)?;
        if state.nodes.contains_key(&full) {
            return Ok(());
        }
        require_parent(&state, &full)?;
        let etag = next_tag(&mut state);
        state.nodes.insert(full.clone(), Node::Dir { etag });
        bump_ancestors(&mut state, &full);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), DavError> {
        let (mut state, full) = self.begin("DELETE", path)?;
        if !state.nodes.contains_key(&full) {
            return Ok(());
        }
        remove_tree(&mut state, &full);
        bump_ancestors(&mut state, &full);
        Ok(())
    }
}

fn status(status: StatusCode) -> DavError {
    DavError::Status {
        status,
        body: String::new(),
    }
}

fn next_tag(state: &mut State) -> String {
    state.counter += 1;
    format!("e{}", state.counter)
}

fn require_parent(state: &State, full: &str) -> Result<(), DavError> {
    let parent = split(full).map(|(parent, _)| parent);
    match parent.and_then(|parent| state.nodes.get(&parent)) {
        Some(Node::Dir { .. }) => Ok(()),
        _ => Err(status(StatusCode::CONFLICT)),
    }
}

fn remove_tree(state: &mut State, full: &str) {
    let prefix = join(full, "");
    state
        .nodes
        .retain(|path, _| path != full && !path.starts_with(&prefix));
}

fn bump_ancestors(state: &mut State, full: &str) {
    let mut current = full.to_string();
    while let Some((parent, _)) = split(&current) {
        let etag = next_tag(state);
        if let Some(Node::Dir { etag: tag }) = state.nodes.get_mut(&parent) {
            *tag = etag;
        }
        current = parent;
    }
}
