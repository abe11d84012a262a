/// Size of a control message buffer. The wire layout of `ControlMessage` is
/// padded up to this, so one buffer always holds exactly one message.
pub(crate) const CTRL_MSG_SIZE: usize = 64;

/// Fixed width of the shared-memory name sent back on the registration
/// socket, zero padded.
pub(crate) const SHM_NAME_LEN: usize = 256;

/// Default size of a pod's metric page in bytes. 4096 keeps the page
/// alignment friendly but 1024 is enough for the default metric set.
pub(crate) const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Default number of RDMA READs issued per pod per scrape tick.
pub(crate) const DEFAULT_MRS_PER_POD: usize = 1;

/// Completion queue depth per connection.
pub(crate) const CQ_DEPTH: usize = 128;

/// Sidecar file the agent writes its registration port into.
pub(crate) const PORT_FILE: &str = ".port";

/// Pod-table sentinel for a slot whose pod has been declared dead.
pub(crate) const POD_SENTINEL: i32 = -1;
