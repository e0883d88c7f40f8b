use std::{
    fs::File,
    future::Future,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::trace;

use crate::{
    net_device::{Interface, QueryError, query_links, set_netns},
    netns::{PROCFS_ROOT, Pid, process_netns_path},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not open network namespace of pid {0} - {1}")]
    CouldntOpenNetns(Pid, std::io::Error),
    #[error("setns failed - {0}")]
    Setns(std::io::Error),
    #[error("failed to list interfaces - {0}")]
    Query(#[from] QueryError),
}

/// OS operations a namespace monitor needs.
///
/// `enter` and `interfaces` are always called on the monitor's own thread, in that order.
pub trait NetnsSystem: Send + Sync + 'static {
    /// Keeps the namespace reachable. Dropping it releases the namespace.
    type Handle: Send + 'static;

    fn open(&self, pid: Pid) -> Result<Self::Handle, Error>;

    /// Moves the calling thread into the namespace.
    fn enter(&self, handle: &Self::Handle) -> Result<(), Error>;

    /// Lists interfaces of the namespace the calling thread is in.
    fn interfaces(&self) -> impl Future<Output = Result<Vec<Interface>, Error>>;
}

/// An open `/proc/<pid>/ns/net`.
#[derive(Debug)]
pub struct NetnsHandle {
    file: File,
    path: PathBuf,
}

impl NetnsHandle {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NetnsHandle {
    fn drop(&mut self) {
        trace!(path = %self.path.display(), "releasing network namespace handle");
    }
}

/// The real system, backed by procfs, `setns(2)` and rtnetlink.
#[derive(Debug, Clone)]
pub struct Host {
    proc_root: PathBuf,
}

impl Host {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new(PROCFS_ROOT)
    }
}

impl NetnsSystem for Host {
    type Handle = NetnsHandle;

    fn open(&self, pid: Pid) -> Result<NetnsHandle, Error> {
        let path = process_netns_path(&self.proc_root, pid);
        let file = File::open(&path).map_err(|err| Error::CouldntOpenNetns(pid, err))?;

        Ok(NetnsHandle { file, path })
    }

    fn enter(&self, handle: &NetnsHandle) -> Result<(), Error> {
        set_netns(handle.file()).map_err(Error::Setns)
    }

    async fn interfaces(&self) -> Result<Vec<Interface>, Error> {
        Ok(query_links().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_fails_for_missing_process() {
        let root = tempfile::tempdir().unwrap();
        let host = Host::new(root.path());

        assert!(matches!(
            host.open(42),
            Err(Error::CouldntOpenNetns(42, _))
        ));
    }

    #[test]
    fn open_keeps_path() {
        let root = tempfile::tempdir().unwrap();
        let ns_dir = root.path().join("42").join("ns");
        std::fs::create_dir_all(&ns_dir).unwrap();
        std::fs::write(ns_dir.join("net"), b"").unwrap();

        let handle = Host::new(root.path()).open(42).unwrap();

        assert_eq!(handle.path(), ns_dir.join("net"));
    }
}
