//! Device filesystem (/dev).
//!
//! A ramfs-style directory holding device nodes. `/dev/zero` and
//! `/dev/null` are always present; the console node bridges the serial
//! port and keyboard for the kernel shell; block-device instances add
//! their `/dev/hdaN` nodes through [`add_device`].

use alloc::{string::ToString, sync::Arc};

use crate::error::KernelResult;

use super::{
    node::{Node, NodeKind, NodeOps},
    ramfs,
};

/// `/dev/null`: reads hit EOF, writes vanish.
struct NullDev;

impl NodeOps for NullDev {
    fn read(&self, _node: &Node, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Ok(0)
    }

    fn write(&self, _node: &Node, _offset: u64, data: &[u8]) -> KernelResult<usize> {
        Ok(data.len())
    }
}

/// `/dev/zero`: endless zeroes, writes vanish.
struct ZeroDev;

impl NodeOps for ZeroDev {
    fn read(&self, _node: &Node, _offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write(&self, _node: &Node, _offset: u64, data: &[u8]) -> KernelResult<usize> {
        Ok(data.len())
    }
}

/// `/dev/console`: writes go to the kernel console, reads poll the
/// keyboard (non-blocking; an empty read means no key is pending).
struct ConsoleDev;

impl NodeOps for ConsoleDev {
    fn read(&self, _node: &Node, _offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let mut n = 0;
        while n < buf.len() {
            match crate::drivers::keyboard::getch() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&self, _node: &Node, _offset: u64, data: &[u8]) -> KernelResult<usize> {
        for &byte in data {
            crate::print!("{}", byte as char);
        }
        Ok(data.len())
    }

    fn selectcheck(&self, _node: &Node) -> KernelResult<bool> {
        Ok(crate::drivers::keyboard::has_pending())
    }
}

fn char_device(name: &str, ops: Arc<dyn NodeOps>) -> Arc<Node> {
    Arc::new(Node::new(name.to_string(), NodeKind::CharDevice, 0, 0o666, ops))
}

/// Build the /dev directory, populate the standard nodes and mount it.
pub fn init() -> KernelResult<()> {
    let dev_root = ramfs::new_dir("[devfs]", 0o755);
    super::mount("/dev", dev_root.clone())?;

    add_device("null", char_device("null", Arc::new(NullDev)))?;
    add_device("zero", char_device("zero", Arc::new(ZeroDev)))?;
    add_device("console", char_device("console", Arc::new(ConsoleDev)))?;

    log::info!("devfs mounted at /dev");
    Ok(())
}

/// Register a device node under /dev.
pub fn add_device(name: &str, node: Arc<Node>) -> KernelResult<()> {
    let dev_root = super::kopen("/dev", super::OpenFlags::empty())?;
    let result = insert(&dev_root, name, node);
    dev_root.close();
    result
}

fn insert(dir: &Arc<Node>, name: &str, node: Arc<Node>) -> KernelResult<()> {
    // Device nodes are driver-owned; they are linked into the directory
    // rather than created through it.
    dir.link(name, node)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn null_device_swallow_and_eof() {
        let null = char_device("null", Arc::new(NullDev));
        assert_eq!(null.write(0, b"discarded").unwrap(), 9);
        let mut buf = [1u8; 4];
        assert_eq!(null.read(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn zero_device_fills_buffer() {
        let zero = char_device("zero", Arc::new(ZeroDev));
        let mut buf = [0xAAu8; 8];
        assert_eq!(zero.read(0, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0u8; 8]);
    }
}
