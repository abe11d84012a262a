//! Per-pod shared-memory pages.

use std::fs::File;
use std::os::fd::AsRawFd;

use log::warn;
use memmap2::MmapRaw;
use nix::{
    fcntl::OFlag,
    sys::mman::{shm_open, shm_unlink},
    sys::stat::{fchmod, Mode},
};

use crate::{
    config::UnlinkPolicy,
    error::{Error, Result},
};

/// A named POSIX shared-memory object the agent owns on behalf of a pod.
///
/// The agent creates and eventually unlinks it; the pod opens it read-write
/// and updates metrics in place. The mapping stays pinned for the lifetime
/// of the pod's RDMA connection, which reads it without coordination.
#[derive(Debug)]
pub(crate) struct SharedPage {
    name: String,
    file: File,
    map: Option<MmapRaw>,
    len: usize,
    unlinked: bool,
}

impl SharedPage {
    /// Creates (or reuses) the object and sizes it to `len` bytes. World
    /// read-write, set explicitly so the umask cannot narrow it.
    pub(crate) fn create(name: &str, len: usize) -> Result<Self> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|err| Error::Shm(format!("shm_open {name}: {err}")))?;
        fchmod(fd.as_raw_fd(), Mode::from_bits_truncate(0o666))
            .map_err(|err| Error::Shm(format!("fchmod {name}: {err}")))?;
        let file = File::from(fd);
        file.set_len(len as u64)
            .map_err(|err| Error::Shm(format!("ftruncate {name}: {err}")))?;
        Ok(Self {
            name: name.to_owned(),
            file,
            map: None,
            len,
            unlinked: false,
        })
    }

    /// Maps the object read-write into this process.
    pub(crate) fn map(&mut self) -> Result<()> {
        let map = MmapRaw::map_raw(&self.file)
            .map_err(|err| Error::Shm(format!("mmap {}: {err}", self.name)))?;
        self.map = Some(map);
        Ok(())
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Base address of the mapping. Valid only after [`map`](Self::map).
    pub(crate) fn addr(&self) -> Result<u64> {
        self.map
            .as_ref()
            .map(|m| m.as_mut_ptr() as u64)
            .ok_or_else(|| Error::Shm(format!("{} is not mapped", self.name)))
    }

    /// Unlinks the object name. The unlink is known to fail occasionally;
    /// the cause is still unclear, so the reaction is a config tunable and
    /// the error always reaches the logs.
    pub(crate) fn unlink(&mut self, policy: UnlinkPolicy) {
        if self.unlinked {
            return;
        }
        match shm_unlink(self.name.as_str()) {
            Ok(()) => self.unlinked = true,
            Err(err) => {
                warn!("shm_unlink {} failed: {err}", self.name);
                if policy == UnlinkPolicy::RetryOnce {
                    match shm_unlink(self.name.as_str()) {
                        Ok(()) => self.unlinked = true,
                        Err(err) => warn!("shm_unlink {} retry failed: {err}", self.name),
                    }
                }
            }
        }
    }
}
