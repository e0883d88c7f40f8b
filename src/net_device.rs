use std::{fmt, fs::File, os::fd::AsRawFd};

use futures::TryStreamExt;
use libc::CLONE_NEWNET;
use rtnetlink::packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use thiserror::Error;

pub type Mac = [u8; 6];

/// A network interface as seen from inside one network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub mtu: Option<u32>,
    pub mac_addr: Option<Mac>,
    /// `veth`, `bridge`, ... when the kernel reports a link kind.
    pub kind: Option<String>,
    pub is_up: bool,
    pub is_loopback: bool,
}

impl Interface {
    pub fn from_link(link: &LinkMessage) -> Self {
        let flags = link.header.flags.bits();

        Self {
            index: link.header.index,
            name: link_name(link.attributes.iter())
                .cloned()
                .unwrap_or_else(|| format!("if{}", link.header.index)),
            mtu: link_mtu(link.attributes.iter()),
            mac_addr: link_mac(link.attributes.iter()),
            kind: link_kind(link.attributes.iter()).map(kind_name),
            is_up: flags & libc::IFF_UP as u32 != 0,
            is_loopback: flags & libc::IFF_LOOPBACK as u32 != 0,
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.index, self.name)?;
        if let Some(kind) = &self.kind {
            write!(f, " ({kind})")?;
        }
        if let Some(mtu) = self.mtu {
            write!(f, " mtu {mtu}")?;
        }
        if let Some(mac) = self.mac_addr {
            write!(
                f,
                " {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            )?;
        }
        let state = match (self.is_up, self.is_loopback) {
            (true, true) => "up,loopback",
            (true, false) => "up",
            (false, true) => "down,loopback",
            (false, false) => "down",
        };
        write!(f, " <{state}>")
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to open rtnetlink connection - {0}")]
    NetlinkConnection(std::io::Error),

    #[error("rtnetlink receiving error - {0}")]
    RtnetlinkRecvError(#[from] rtnetlink::Error),
}

/// Dumps all links of the network namespace the calling thread is in.
///
/// Must be polled inside a `LocalSet` on the thread whose namespace should be listed:
/// the netlink socket belongs to the namespace of the thread that opens it.
pub async fn query_links() -> Result<Vec<Interface>, QueryError> {
    let (conn, handle, _) = rtnetlink::new_connection().map_err(QueryError::NetlinkConnection)?;
    let conn_handle = tokio::task::spawn_local(conn);

    let mut stream = handle.link().get().execute();
    let mut interfaces = Vec::new();

    let result = async {
        while let Some(link) = stream.try_next().await? {
            interfaces.push(Interface::from_link(&link));
        }
        Ok::<_, QueryError>(())
    }
    .await;

    drop(stream);
    drop(handle);
    conn_handle.abort();

    result?;
    interfaces.sort_by_key(|interface| interface.index);
    Ok(interfaces)
}

/// Moves the calling thread into the network namespace behind `fd`.
pub fn set_netns(fd: &File) -> std::io::Result<()> {
    unsafe {
        if libc::setns(fd.as_raw_fd(), CLONE_NEWNET) != 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn link_name<'a>(link: impl Iterator<Item = &'a LinkAttribute>) -> Option<&'a String> {
    link.filter_map(|x| {
        if let LinkAttribute::IfName(name) = x {
            Some(name)
        } else {
            None
        }
    })
    .next()
}

fn link_mtu<'a>(link: impl Iterator<Item = &'a LinkAttribute>) -> Option<u32> {
    link.filter_map(|x| {
        if let LinkAttribute::Mtu(mtu) = x {
            Some(*mtu)
        } else {
            None
        }
    })
    .next()
}

fn link_mac<'a>(link: impl Iterator<Item = &'a LinkAttribute>) -> Option<Mac> {
    link.filter_map(|x| {
        if let LinkAttribute::Address(addr) = x {
            Mac::try_from(addr.as_slice()).ok()
        } else {
            None
        }
    })
    .next()
}

fn link_kind<'a>(link: impl Iterator<Item = &'a LinkAttribute>) -> Option<&'a InfoKind> {
    link.filter_map(|x| {
        if let LinkAttribute::LinkInfo(link_infos) = x {
            Some(link_infos)
        } else {
            None
        }
    })
    .filter_map(|x| {
        x.iter()
            .filter_map(|y| {
                if let LinkInfo::Kind(kind) = y {
                    Some(kind)
                } else {
                    None
                }
            })
            .next()
    })
    .next()
}

fn kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Other(other) => other.clone(),
        known => format!("{known:?}").to_lowercase(),
    }
}
