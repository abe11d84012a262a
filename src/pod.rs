//! Pod-side registration client.
//!
//! The client half of the local handshake: discover the agent through its
//! `.port` sidecar, send the pod id, open and map the shared page the agent
//! replies with. What a pod writes into the page is its own business; the
//! collector samples it without coordination, so updates should tolerate
//! torn reads (monotonic counters and gauges do).

use std::{
    fs::File,
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    path::Path,
};

use memmap2::MmapRaw;
use nix::{
    fcntl::OFlag,
    sys::mman::shm_open,
    sys::stat::Mode,
};

use crate::{
    constants::{PORT_FILE, SHM_NAME_LEN},
    error::{Error, Result},
};

/// A pod's mapped metric page.
#[derive(Debug)]
pub struct MetricPage {
    name: String,
    map: MmapRaw,
    len: usize,
    _file: File,
}

impl MetricPage {
    /// Shared-memory object name backing the page.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes `data` at `offset`, in place, no syscalls.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.len {
            return Err(Error::Shm(format!(
                "write of {} bytes at {offset} exceeds page of {}",
                data.len(),
                self.len
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }
}

/// Reads the agent's registration port from its `.port` sidecar.
pub fn discover_port(workdir: &Path) -> Result<u16> {
    let text = std::fs::read_to_string(workdir.join(PORT_FILE))?;
    text.trim()
        .parse()
        .map_err(|err| Error::Transport(format!("malformed .port file: {err}")))
}

/// Registers `pod_id` with the agent and maps the returned page.
pub fn register(agent: SocketAddr, pod_id: u32) -> Result<MetricPage> {
    let mut stream = TcpStream::connect(agent)
        .map_err(|err| Error::Transport(format!("agent {agent}: {err}")))?;
    stream.write_all(&pod_id.to_be_bytes())?;

    let mut name_buf = [0u8; SHM_NAME_LEN];
    stream.read_exact(&mut name_buf)?;
    let end = name_buf.iter().position(|&b| b == 0).unwrap_or(SHM_NAME_LEN);
    let name = std::str::from_utf8(&name_buf[..end])
        .map_err(|err| Error::Protocol(format!("shm name not ascii: {err}")))?
        .to_owned();
    drop(stream);

    let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty())
        .map_err(|err| Error::Shm(format!("shm_open {name}: {err}")))?;
    let file = File::from(fd);
    let len = file.metadata()?.len() as usize;
    let map = MmapRaw::map_raw(&file).map_err(|err| Error::Shm(format!("mmap {name}: {err}")))?;

    Ok(MetricPage {
        name,
        map,
        len,
        _file: file,
    })
}
