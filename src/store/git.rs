//! Store compartilhado sobre um repositório Git via libgit2.
//!
//! O [`GitStore`] usa o working tree como visão local, `fetch` + fast-forward
//! como sincronização e `commit` + `push` como publicação. Um push recusado
//! por não ser fast-forward significa que outro host publicou antes: é o
//! mecanismo de exclusão mútua de todo o sistema.
//!
//! Apenas os diretórios gerenciados (manifests, resultados, claims, erros)
//! são adicionados ao stage, inspecionados ou limpos.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{
    Cred, CredentialType, ErrorCode, FetchOptions, IndexAddOption, Oid, PushOptions,
    RemoteCallbacks, Repository, ResetType, Signature, StatusOptions,
};
use tracing::{debug, warn};

use crate::error::{BenchError, Result};
use crate::store::{Publish, SharedStore, SyncStatus};

/// Store compartilhado apoiado em um clone Git local.
pub struct GitStore {
    repo: Repository,
    workdir: PathBuf,
    remote: Option<String>,
    branch: String,
    scope: Vec<String>,
}

impl GitStore {
    /// Abre um repositório existente.
    ///
    /// `remote = None` ativa o modo local: commits são criados, mas nunca
    /// enviados, e a sincronização é um no-op.
    pub fn open(
        path: &Path,
        remote: Option<String>,
        branch: impl Into<String>,
        scope: Vec<String>,
    ) -> Result<Self> {
        let repo = Repository::open(path)?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| BenchError::Store("repository has no working tree".into()))?
            .to_path_buf();
        Ok(Self {
            repo,
            workdir,
            remote,
            branch: branch.into(),
            scope,
        })
    }

    /// Retorna o nome da branch atual.
    pub fn current_branch(&self) -> Result<String> {
        let head = self.repo.head()?;
        let name = head
            .shorthand()
            .ok_or_else(|| BenchError::Store("branch name is not valid UTF-8".into()))?
            .to_string();
        Ok(name)
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.workdir.join(path)
    }

    fn head_oid(&self) -> Result<Oid> {
        Ok(self.repo.head()?.peel_to_commit()?.id())
    }

    fn tracking_ref(&self, remote: &str) -> String {
        format!("refs/remotes/{remote}/{}", self.branch)
    }

    // Commit que a visão local deve espelhar após um discard.
    fn upstream_oid(&self) -> Result<Oid> {
        match &self.remote {
            Some(remote) => {
                let reference = self.repo.find_reference(&self.tracking_ref(remote))?;
                Ok(reference.peel_to_commit()?.id())
            }
            None => self.head_oid(),
        }
    }

    /// Verifica se há mudanças não publicadas nos diretórios gerenciados.
    fn has_local_changes(&self) -> Result<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        for dir in &self.scope {
            opts.pathspec(dir.as_str());
        }
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Busca a branch remota e retorna o commit dela, ou `None` no modo local.
    fn fetch(&self) -> Result<Option<Oid>> {
        let Some(name) = &self.remote else {
            return Ok(None);
        };
        let mut remote = self.repo.find_remote(name)?;
        let refspec = format!("+refs/heads/{}:{}", self.branch, self.tracking_ref(name));
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(auth_callbacks());
        remote.fetch(&[refspec.as_str()], Some(&mut opts), None)?;
        Ok(Some(self.upstream_oid()?))
    }

    fn fast_forward(&self, target: Oid) -> Result<()> {
        let object = self.repo.find_object(target, None)?;
        self.repo
            .checkout_tree(&object, Some(CheckoutBuilder::new().safe()))?;
        let refname = format!("refs/heads/{}", self.branch);
        self.repo
            .reference(&refname, target, true, "benchgrid: fast-forward")?;
        self.repo.set_head(&refname)?;
        Ok(())
    }

    /// Envia a branch local; um push não fast-forward é uma recusa, não um erro.
    fn push(&self) -> Result<Publish> {
        let Some(name) = &self.remote else {
            return Ok(Publish::Accepted);
        };
        let mut remote = self.repo.find_remote(name)?;
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", self.branch);

        let refused: RefCell<Option<String>> = RefCell::new(None);
        let result = {
            let mut callbacks = auth_callbacks();
            callbacks.push_update_reference(|refname, status| {
                if let Some(message) = status {
                    *refused.borrow_mut() = Some(format!("{refname}: {message}"));
                }
                Ok(())
            });
            let mut opts = PushOptions::new();
            opts.remote_callbacks(callbacks);
            remote.push(&[refspec.as_str()], Some(&mut opts))
        };

        match result {
            Ok(()) => match refused.into_inner() {
                Some(reason) => {
                    debug!(%reason, "push refused by remote");
                    Ok(Publish::Rejected)
                }
                None => Ok(Publish::Accepted),
            },
            Err(e) if e.code() == ErrorCode::NotFastForward => {
                debug!(error = %e, "push is not a fast-forward");
                Ok(Publish::Rejected)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Adiciona ao stage tudo nos diretórios gerenciados e cria um commit.
    ///
    /// Retorna `None` quando não há nada a commitar.
    fn commit(&self, message: &str) -> Result<Option<Oid>> {
        let pathspecs: Vec<&str> = if self.scope.is_empty() {
            vec!["*"]
        } else {
            self.scope.iter().map(String::as_str).collect()
        };

        let mut index = self.repo.index()?;
        index.add_all(pathspecs.iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(pathspecs.iter(), None)?;
        index.write()?;

        let tree_oid = index.write_tree()?;
        let parent = self.repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_oid {
            return Ok(None);
        }
        let tree = self.repo.find_tree(tree_oid)?;

        let sig = self
            .repo
            .signature()
            .or_else(|_| Signature::now("benchgrid", "benchgrid@localhost"))?;

        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        Ok(Some(oid))
    }
}

impl SharedStore for GitStore {
    fn sync(&mut self) -> Result<SyncStatus> {
        if self.has_local_changes()? {
            return Ok(SyncStatus::Diverged);
        }
        let Some(upstream) = self.fetch()? else {
            return Ok(SyncStatus::UpToDate);
        };
        let head = self.head_oid()?;
        if head == upstream {
            return Ok(SyncStatus::UpToDate);
        }
        if self.repo.graph_descendant_of(upstream, head)? {
            self.fast_forward(upstream)?;
            return Ok(SyncStatus::FastForwarded);
        }
        // Commits locais não enviados.
        Ok(SyncStatus::Diverged)
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.full_path(path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.full_path(dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn write(&mut self, path: &str, contents: &[u8]) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, contents)?;
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        match fs::remove_file(self.full_path(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn publish(&mut self, message: &str) -> Result<Publish> {
        if self.commit(message)?.is_none() {
            return Ok(Publish::Accepted);
        }
        self.push()
    }

    fn discard(&mut self) -> Result<()> {
        let target = self.upstream_oid()?;
        let object = self.repo.find_object(target, None)?;
        self.repo.reset(&object, ResetType::Mixed, None)?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        for dir in &self.scope {
            checkout.path(dir.as_str());
        }
        self.repo.checkout_tree(&object, Some(&mut checkout))?;

        if self.has_local_changes()? {
            warn!(workdir = %self.workdir.display(), "local changes survived discard");
        }
        Ok(())
    }
}

/// Credenciais via ssh-agent ou credential helper do Git.
fn auth_callbacks<'a>() -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(|url, username, allowed| {
        if allowed.contains(CredentialType::SSH_KEY) {
            Cred::ssh_key_from_agent(username.unwrap_or("git"))
        } else if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            let config = git2::Config::open_default()?;
            Cred::credential_helper(&config, url, username)
        } else {
            Cred::default()
        }
    });
    callbacks
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::RepositoryInitOptions;
    use tempfile::TempDir;

    /// Auxiliar: cria um repositório bare "origin" com um commit inicial na branch main.
    fn setup_origin() -> (TempDir, String) {
        let tmp = TempDir::new().unwrap();
        let origin = tmp.path().join("origin.git");
        let mut opts = RepositoryInitOptions::new();
        opts.bare(true).initial_head("main");
        Repository::init_opts(&origin, &opts).unwrap();

        let seed_dir = tmp.path().join("seed");
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let seed = Repository::init_opts(&seed_dir, &opts).unwrap();
        fs::write(seed_dir.join("README.md"), "benchmark results\n").unwrap();
        let mut index = seed.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_oid = index.write_tree().unwrap();
        let tree = seed.find_tree(tree_oid).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        seed.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();

        let url = origin.to_str().unwrap().to_string();
        let mut remote = seed.remote("origin", &url).unwrap();
        remote
            .push(&["refs/heads/main:refs/heads/main"], None)
            .unwrap();
        (tmp, url)
    }

    fn clone_host(tmp: &TempDir, url: &str, host: &str) -> GitStore {
        let dir = tmp.path().join(host);
        Repository::clone(url, &dir).unwrap();
        GitStore::open(
            &dir,
            Some("origin".to_string()),
            "main",
            vec!["phase".to_string(), "runs".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn open_fails_on_non_repo_path() {
        let tmp = TempDir::new().unwrap();
        let result = GitStore::open(tmp.path(), None, "main", Vec::new());
        assert!(result.is_err());
    }

    #[test]
    fn clone_starts_up_to_date_on_main() {
        let (tmp, url) = setup_origin();
        let mut store = clone_host(&tmp, &url, "r2d2");
        assert_eq!(store.current_branch().unwrap(), "main");
        assert_eq!(store.sync().unwrap(), SyncStatus::UpToDate);
    }

    #[test]
    fn published_change_reaches_other_host() {
        let (tmp, url) = setup_origin();
        let mut a = clone_host(&tmp, &url, "r2d2");
        let mut b = clone_host(&tmp, &url, "c3po");

        a.write("phase/p1.txt", b"x_m_c_0.json\n").unwrap();
        assert_eq!(a.publish("compile p1").unwrap(), Publish::Accepted);

        assert_eq!(b.sync().unwrap(), SyncStatus::FastForwarded);
        assert_eq!(
            b.read("phase/p1.txt").unwrap(),
            Some(b"x_m_c_0.json\n".to_vec())
        );
        assert_eq!(b.list("phase").unwrap(), vec!["p1.txt".to_string()]);
    }

    #[test]
    fn racing_publish_is_rejected() {
        let (tmp, url) = setup_origin();
        let mut a = clone_host(&tmp, &url, "r2d2");
        let mut b = clone_host(&tmp, &url, "c3po");

        a.write("runs/claims/x.claim", b"r2d2").unwrap();
        b.write("runs/claims/x.claim", b"c3po").unwrap();

        assert_eq!(a.publish("claim x").unwrap(), Publish::Accepted);
        assert_eq!(b.publish("claim x").unwrap(), Publish::Rejected);

        assert_eq!(b.sync().unwrap(), SyncStatus::Diverged);
        b.discard().unwrap();
        // The diverged sync already fetched, so discard lands on upstream.
        assert_eq!(b.sync().unwrap(), SyncStatus::UpToDate);
        assert_eq!(
            b.read("runs/claims/x.claim").unwrap(),
            Some(b"r2d2".to_vec())
        );
    }

    #[test]
    fn removal_is_published() {
        let (tmp, url) = setup_origin();
        let mut a = clone_host(&tmp, &url, "r2d2");
        let mut b = clone_host(&tmp, &url, "c3po");

        a.write("runs/claims/x.claim", b"r2d2").unwrap();
        a.publish("claim x").unwrap();
        a.remove("runs/claims/x.claim").unwrap();
        a.write("runs/x.json", b"{}").unwrap();
        a.publish("finish x").unwrap();

        b.sync().unwrap();
        assert!(!b.exists("runs/claims/x.claim").unwrap());
        assert!(b.exists("runs/x.json").unwrap());
    }

    #[test]
    fn discard_drops_untracked_files_in_scope_only() {
        let (tmp, url) = setup_origin();
        let mut a = clone_host(&tmp, &url, "r2d2");
        let outside = tmp.path().join("r2d2").join("benchgrid.toml");
        fs::write(&outside, "branch = \"main\"\n").unwrap();

        a.write("runs/claims/y.claim", b"r2d2").unwrap();
        assert_eq!(a.sync().unwrap(), SyncStatus::Diverged);
        a.discard().unwrap();

        assert!(!a.exists("runs/claims/y.claim").unwrap());
        assert!(outside.exists());
        assert_eq!(a.sync().unwrap(), SyncStatus::UpToDate);
    }

    #[test]
    fn empty_publish_creates_no_commit() {
        let (tmp, url) = setup_origin();
        let mut a = clone_host(&tmp, &url, "r2d2");
        let before = a.head_oid().unwrap();
        assert_eq!(a.publish("nothing").unwrap(), Publish::Accepted);
        assert_eq!(a.head_oid().unwrap(), before);
    }

    #[test]
    fn local_mode_commits_without_remote() {
        let (tmp, url) = setup_origin();
        let dir = tmp.path().join("solo");
        Repository::clone(&url, &dir).unwrap();
        let mut store = GitStore::open(&dir, None, "main", vec!["runs".to_string()]).unwrap();
        let before = store.head_oid().unwrap();

        store.write("runs/x.json", b"{}").unwrap();
        assert_eq!(store.publish("finish x").unwrap(), Publish::Accepted);
        assert_ne!(store.head_oid().unwrap(), before);
        assert_eq!(store.sync().unwrap(), SyncStatus::UpToDate);
    }
}
