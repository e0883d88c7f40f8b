use std::{
    collections::{BTreeMap, btree_map},
    ffi::OsString,
    num::ParseIntError,
    path::{Component, Path, PathBuf},
};

use glob::{Pattern, glob};
use thiserror::Error;
use tracing::{debug, warn};

pub type INode = u64;
pub type Pid = u32;

pub const PROCFS_ROOT: &str = "/proc";

/// One scanned process: its pid and the inode of the network namespace it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: Pid,
    pub netns: INode,
}

/// Network namespace inode -> representative pid.
///
/// Different namespaces have different inodes, and the same namespace always has the same inode.
/// Any process inside a namespace can be used to open it, the one with the lowest pid is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceMap {
    representatives: BTreeMap<INode, Pid>,
}

impl NamespaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one record into the map. Lowest pid wins.
    pub fn observe(&mut self, record: ProcessRecord) {
        self.representatives
            .entry(record.netns)
            .and_modify(|pid| *pid = (*pid).min(record.pid))
            .or_insert(record.pid);
    }

    pub fn representative(&self, netns: INode) -> Option<Pid> {
        self.representatives.get(&netns).copied()
    }

    pub fn len(&self) -> usize {
        self.representatives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.representatives.is_empty()
    }

    /// Iterates `(inode, pid)` pairs in ascending inode order.
    pub fn iter(&self) -> impl Iterator<Item = (INode, Pid)> + '_ {
        self.representatives.iter().map(|(&inode, &pid)| (inode, pid))
    }
}

impl FromIterator<ProcessRecord> for NamespaceMap {
    fn from_iter<T: IntoIterator<Item = ProcessRecord>>(iter: T) -> Self {
        let mut map = NamespaceMap::new();
        for record in iter {
            map.observe(record);
        }
        map
    }
}

impl IntoIterator for NamespaceMap {
    type Item = (INode, Pid);
    type IntoIter = btree_map::IntoIter<INode, Pid>;

    fn into_iter(self) -> Self::IntoIter {
        self.representatives.into_iter()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot list processes in {0} - {1}")]
    ProcfsUnavailable(PathBuf, std::io::Error),
    #[error("procfs root {0} is not valid utf-8")]
    NonUtf8Root(PathBuf),
    #[error("bad process listing pattern - {0}")]
    Pattern(#[from] glob::PatternError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseLinkError {
    #[error("link '{0}' has no `<type>:[<inode>]` shape")]
    Malformed(String),
    #[error("link '{0}' has incorrect inode - {1}")]
    NotAnInode(String, ParseIntError),
}

/// Parses a namespace link target such as `net:[4026531840]` into its inode.
pub fn parse_netns_link(link: &str) -> Result<INode, ParseLinkError> {
    let malformed = || ParseLinkError::Malformed(link.to_owned());

    let (_kind, rest) = link.split_once(':').ok_or_else(malformed)?;
    let inode = rest
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(malformed)?;

    inode
        .parse::<INode>()
        .map_err(|err| ParseLinkError::NotAnInode(link.to_owned(), err))
}

/// `<proc_root>/<pid>/ns/net`
pub fn process_netns_path(proc_root: &Path, pid: Pid) -> PathBuf {
    proc_root.join(pid.to_string()).join("ns").join("net")
}

/// Scans every process under `proc_root` and returns one representative pid per network namespace.
///
/// Processes whose namespace link cannot be read or parsed are skipped. Only a failure to list
/// processes at all is an error.
pub async fn resolve(proc_root: &Path) -> Result<NamespaceMap, Error> {
    let mut map = NamespaceMap::new();

    let mut pids = PidsIterator::new(proc_root).await?;
    while let Some(pid) = pids.next() {
        let link_path = process_netns_path(proc_root, pid);

        let link = match tokio::fs::read_link(&link_path).await {
            Ok(link) => link,
            Err(err) => {
                debug!(pid, error = %err, "cannot read network namespace link, skipping");
                continue;
            }
        };

        let netns = match link.to_str().map(parse_netns_link) {
            Some(Ok(netns)) => netns,
            Some(Err(err)) => {
                warn!(pid, error = %err, "malformed network namespace link, skipping");
                continue;
            }
            None => {
                warn!(pid, link = %link.display(), "network namespace link is not utf-8, skipping");
                continue;
            }
        };

        map.observe(ProcessRecord { pid, netns });
    }

    Ok(map)
}

// ==== Utilities ====

#[derive(Debug, Error)]
enum ParseProcfsError {
    #[error("path is not under procfs root")]
    NotUnderRoot,
    #[error("path does not contain a PID")]
    NoPid,
    #[error("PID OS string cannot be parsed")]
    ErrorneousOsPid(OsString),
    #[error("path has incorrect PID - '{0}' - {1}")]
    NotAPid(String, ParseIntError),
}

fn parse_procfs_pid(proc_root: &Path, path: &Path) -> Result<Pid, ParseProcfsError> {
    let relative = path
        .strip_prefix(proc_root)
        .map_err(|_| ParseProcfsError::NotUnderRoot)?;

    let Some(Component::Normal(pid)) = relative.components().next() else {
        return Err(ParseProcfsError::NoPid);
    };
    let pid = pid
        .to_str()
        .ok_or_else(|| ParseProcfsError::ErrorneousOsPid(pid.to_owned()))?;

    pid.parse::<Pid>()
        .map_err(|err| ParseProcfsError::NotAPid(pid.to_owned(), err))
}

struct PidsIterator {
    pids: Box<dyn Iterator<Item = Pid> + Send>,
}

impl PidsIterator {
    pub async fn new(proc_root: &Path) -> Result<Self, Error> {
        // glob swallows an unreadable root, so read it once up front.
        let _entries = tokio::fs::read_dir(proc_root)
            .await
            .map_err(|err| Error::ProcfsUnavailable(proc_root.to_owned(), err))?;

        let root = proc_root
            .to_str()
            .ok_or_else(|| Error::NonUtf8Root(proc_root.to_owned()))?;
        let pattern = Path::new(&Pattern::escape(root)).join("[0-9]*");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| Error::NonUtf8Root(proc_root.to_owned()))?;

        let root = proc_root.to_owned();
        let pids = glob(pattern)?
            .filter_map(|entry| entry.ok())
            .filter_map(move |path| match parse_procfs_pid(&root, &path) {
                Ok(pid) => Some(pid),
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "not a process entry");
                    None
                }
            });

        Ok(Self {
            pids: Box::new(pids),
        })
    }

    pub fn next(&mut self) -> Option<Pid> {
        self.pids.next()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, os::unix::fs::symlink};

    use proptest::{collection::vec, prelude::*};

    use super::*;

    fn fake_process(root: &Path, pid: &str, link: Option<&str>) {
        let ns_dir = root.join(pid).join("ns");
        std::fs::create_dir_all(&ns_dir).unwrap();
        if let Some(link) = link {
            symlink(link, ns_dir.join("net")).unwrap();
        }
    }

    #[test]
    fn parses_net_link() {
        assert_eq!(parse_netns_link("net:[4026531840]"), Ok(4026531840));
        assert_eq!(parse_netns_link("net:[1]"), Ok(1));
    }

    #[test]
    fn rejects_malformed_links() {
        assert!(matches!(
            parse_netns_link("net:4026531840"),
            Err(ParseLinkError::Malformed(_))
        ));
        assert!(matches!(
            parse_netns_link("4026531840"),
            Err(ParseLinkError::Malformed(_))
        ));
        assert!(matches!(
            parse_netns_link("net:[abc]"),
            Err(ParseLinkError::NotAnInode(..))
        ));
        assert!(matches!(
            parse_netns_link("net:[]"),
            Err(ParseLinkError::NotAnInode(..))
        ));
    }

    #[test]
    fn lowest_pid_is_representative() {
        let map: NamespaceMap = [
            ProcessRecord { pid: 10, netns: 100 },
            ProcessRecord { pid: 5, netns: 100 },
            ProcessRecord { pid: 7, netns: 200 },
        ]
        .into_iter()
        .collect();

        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(100, 5), (200, 7)]);
    }

    #[test]
    fn pid_from_procfs_path() {
        let root = Path::new("/proc");
        assert_eq!(
            parse_procfs_pid(root, Path::new("/proc/42")).unwrap(),
            42
        );
        assert!(matches!(
            parse_procfs_pid(root, Path::new("/sys/42")),
            Err(ParseProcfsError::NotUnderRoot)
        ));
        assert!(matches!(
            parse_procfs_pid(root, Path::new("/proc/12abc")),
            Err(ParseProcfsError::NotAPid(..))
        ));
        assert!(matches!(
            parse_procfs_pid(root, Path::new("/proc")),
            Err(ParseProcfsError::NoPid)
        ));
    }

    #[tokio::test]
    async fn resolves_fake_procfs() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), "10", Some("net:[100]"));
        fake_process(root.path(), "5", Some("net:[100]"));
        fake_process(root.path(), "7", Some("net:[200]"));

        let map = resolve(root.path()).await.unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.representative(100), Some(5));
        assert_eq!(map.representative(200), Some(7));
    }

    #[tokio::test]
    async fn bad_records_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), "3", Some("net:[300]"));
        fake_process(root.path(), "1", Some("net:300"));
        fake_process(root.path(), "2", None);
        fake_process(root.path(), "4", Some("net:[not-a-number]"));
        fake_process(root.path(), "12abc", Some("net:[400]"));
        fake_process(root.path(), "self", Some("net:[500]"));

        let map = resolve(root.path()).await.unwrap();

        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(300, 3)]);
    }

    #[tokio::test]
    async fn glob_characters_in_root_are_literal() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proc[0-9]*?");
        fake_process(&root, "12", Some("net:[120]"));
        // Would match the unescaped pattern.
        fake_process(&tmp.path().join("proc1xx"), "1", Some("net:[999]"));

        let map = resolve(&root).await.unwrap();

        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(120, 12)]);
    }

    #[tokio::test]
    async fn resolves_on_a_spawned_task() {
        let tmp = tempfile::tempdir().unwrap();
        fake_process(tmp.path(), "8", Some("net:[80]"));
        let root = tmp.path().to_owned();

        let map = tokio::spawn(async move { resolve(&root).await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(map.representative(80), Some(8));
    }

    #[tokio::test]
    async fn missing_procfs_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");

        assert!(matches!(
            resolve(&missing).await,
            Err(Error::ProcfsUnavailable(..))
        ));
    }

    fn records() -> impl Strategy<Value = Vec<ProcessRecord>> {
        vec(
            (1u32..500, 0u64..20).prop_map(|(pid, netns)| ProcessRecord { pid, netns }),
            0..200,
        )
    }

    proptest! {
        #[test]
        fn representative_is_minimum_pid(records in records()) {
            let map: NamespaceMap = records.iter().copied().collect();

            let mut expected: HashMap<INode, Pid> = HashMap::new();
            for record in &records {
                let pid = expected.entry(record.netns).or_insert(record.pid);
                *pid = (*pid).min(record.pid);
            }

            prop_assert_eq!(map.len(), expected.len());
            for (netns, pid) in expected {
                prop_assert_eq!(map.representative(netns), Some(pid));
            }
        }

        #[test]
        fn unique_pids_never_shared_across_namespaces(netnses in vec(0u64..1000, 0..100)) {
            // One process per pid, as on a real host.
            let map: NamespaceMap = netnses
                .iter()
                .enumerate()
                .map(|(i, &netns)| ProcessRecord { pid: i as Pid + 1, netns })
                .collect();

            let mut seen = HashMap::new();
            for (netns, pid) in map.iter() {
                if let Some(other) = seen.insert(pid, netns) {
                    prop_assert_eq!(other, netns);
                }
            }
        }
    }
}
