// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scatter-gather descriptor chain walking and bulk copy (spec.md §4.5.4).

use vm_memory::GuestPhysAddr;

use crate::error::{DevError, DevResult};
use crate::virtio::queue::{DescriptorHandle, DeviceQueue, DESC_F_WRITE};

/// One descriptor in a walked chain, with bookkeeping for `conclude_chain_use`.
#[derive(Copy, Clone, Debug)]
pub struct Node {
    pub address: u64,
    pub length: u32,
    pub flags: u16,
    pub next: u16,
    pub desc_handle: DescriptorHandle,
    /// Conservative lower bound on bytes written into this node so far,
    /// updated by `copy` (spec.md §4.5.4).
    pub prefix_written_bytes: u32,
}

impl Node {
    pub fn writable(&self) -> bool {
        self.flags & DESC_F_WRITE != 0
    }
}

/// A walked descriptor chain: the root handle plus its nodes in order.
pub struct Chain {
    pub root: DescriptorHandle,
    pub nodes: Vec<Node>,
    pub complete: bool,
}

/// `Sg::Buffer`: a chain, or a bare linear host buffer, so `copy` can treat
/// both uniformly (spec.md §4.5.4).
pub enum Buffer<'a> {
    Chain(&'a mut Chain),
    Linear(&'a mut [u8]),
}

/// Walks a descriptor chain starting at `root_desc` (or pops a new one from
/// `queue` if `None`), per spec.md §4.5.4.
pub fn walk_chain(queue: &DeviceQueue, root_desc: Option<DescriptorHandle>) -> DevResult<Chain> {
    let root = match root_desc {
        Some(h) => h,
        None => queue.recv()?,
    };

    let mut nodes = Vec::new();
    let mut handle = root;
    let mut complete = false;
    let mut seen_writable = false;

    for _ in 0..=queue.size() {
        let desc = queue.read_descriptor(handle.index)?;
        if desc.flags & DESC_F_WRITE != 0 {
            seen_writable = true;
        } else if seen_writable {
            // readable-after-writable violates the standard's ordering
            // invariant (spec.md §4.5.4).
            return Err(DevError::NotRecoverable);
        }
        nodes.push(Node {
            address: desc.address,
            length: desc.length,
            flags: desc.flags,
            next: desc.next,
            desc_handle: handle,
            prefix_written_bytes: 0,
        });
        match queue.next_in_chain(&desc)? {
            Some(_) => handle = DescriptorHandle { index: desc.next },
            None => {
                complete = true;
                break;
            }
        }
    }
    if !complete {
        return Err(DevError::NotRecoverable);
    }

    Ok(Chain { root, nodes, complete })
}

/// Translates a GPA to a host pointer, optionally applying IOMMU-style
/// translation (spec.md §4.5.4). The core only defines the interface; a
/// real ACCESS_PLATFORM-aware transport supplies the implementation.
pub trait ChainAccessor {
    fn translate(&self, gpa: GuestPhysAddr, size: u64, write: bool) -> DevResult<*mut u8>;
}

/// Bulk-copies `size` bytes between two `Buffer`s, segment by segment,
/// enforcing descriptor permissions and updating `prefix_written_bytes` on
/// writable destination nodes (spec.md §4.5.4).
///
/// `driver_owned` relaxes the read-from-write-only check for verification
/// tooling that inspects a driver's own chain.
pub fn copy(
    accessor: &dyn ChainAccessor,
    dst: &mut Buffer,
    src: &mut Buffer,
    size: u64,
    driver_owned: bool,
) -> DevResult<u64> {
    let mut remaining = size;
    let mut copied = 0u64;
    let mut dst_cursor = 0usize;
    let mut src_cursor = 0usize;

    while remaining > 0 {
        let dst_seg = next_segment(accessor, dst, dst_cursor, true, driver_owned)?;
        let src_seg = next_segment(accessor, src, src_cursor, false, driver_owned)?;
        let (dst_ptr, dst_avail) = match dst_seg {
            Some(s) => s,
            None => break,
        };
        let (src_ptr, src_avail) = match src_seg {
            Some(s) => s,
            None => break,
        };
        let n = remaining.min(dst_avail as u64).min(src_avail as u64) as usize;
        if n == 0 {
            break;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src_ptr, dst_ptr, n);
        }
        if let Buffer::Chain(chain) = dst {
            mark_written(chain, dst_cursor, n as u32);
        }
        copied += n as u64;
        remaining -= n as u64;
        dst_cursor += n;
        src_cursor += n;
    }
    Ok(copied)
}

/// Attributes `written` bytes starting at logical offset `cursor` to the
/// node(s) of `chain` they fall in (spec.md §4.5.4 `prefix_written_bytes`
/// heuristic: a lower bound, not an exact accounting of partial writes).
fn mark_written(chain: &mut Chain, cursor: usize, written: u32) {
    let mut offset = cursor;
    let mut remaining = written;
    for node in chain.nodes.iter_mut() {
        let len = node.length as usize;
        if offset >= len {
            offset -= len;
            continue;
        }
        let available = (len - offset) as u32;
        let take = remaining.min(available);
        if offset == 0 {
            node.prefix_written_bytes = node.prefix_written_bytes.max(take);
        }
        remaining = remaining.saturating_sub(take);
        offset = 0;
        if remaining == 0 {
            break;
        }
    }
}

/// Resolves the next host pointer in `buf` starting at byte offset
/// `cursor` within the buffer's logical stream, and its length.
fn next_segment(
    accessor: &dyn ChainAccessor,
    buf: &mut Buffer,
    cursor: usize,
    need_write: bool,
    driver_owned: bool,
) -> DevResult<Option<(*mut u8, usize)>> {
    match buf {
        Buffer::Linear(bytes) => {
            if cursor >= bytes.len() {
                return Ok(None);
            }
            Ok(Some((unsafe { bytes.as_mut_ptr().add(cursor) }, bytes.len() - cursor)))
        }
        Buffer::Chain(chain) => {
            let mut offset = cursor;
            for node in chain.nodes.iter() {
                let len = node.length as usize;
                if offset < len {
                    if need_write && !node.writable() {
                        return Err(DevError::Permission);
                    }
                    if !need_write && node.writable() && !driver_owned {
                        return Err(DevError::Permission);
                    }
                    let ptr = accessor.translate(GuestPhysAddr(node.address), node.length as u64, need_write)?;
                    return Ok(Some((unsafe { ptr.add(offset) }, len - offset)));
                }
                offset -= len;
            }
            Ok(None)
        }
    }
}

/// Returns `root` to its queue via `send`, with the conservative
/// lower-bound length accumulated in the chain's writable prefix (spec.md
/// §4.5.4).
pub fn conclude_chain_use(queue: &DeviceQueue, chain: &Chain) -> DevResult {
    let written: u32 = chain
        .nodes
        .iter()
        .filter(|n| n.writable())
        .map(|n| n.prefix_written_bytes)
        .sum();
    queue.send(chain.root, written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::queue::{Descriptor, QueueMem};
    use std::sync::Arc;
    use vm_memory::{AddressSpaceProvider, AsCred, HostVirtAddr, Range, SimpleAS};

    struct FakeProvider {
        backing: std::sync::Mutex<Vec<u8>>,
    }

    impl AddressSpaceProvider for FakeProvider {
        fn mmap_update(&self, _hva: HostVirtAddr, _size: u64, _cred: AsCred) -> base::Result<()> {
            Ok(())
        }
        fn map_host(&self, _mem_descriptor: u64, _size: u64, _cred: AsCred) -> base::Result<HostVirtAddr> {
            Ok(HostVirtAddr(self.backing.lock().unwrap().as_ptr() as usize))
        }
        fn unmap_host(&self, _hva: HostVirtAddr, _size: u64) -> base::Result<()> {
            Ok(())
        }
    }

    fn mem_with(size: u64) -> (Arc<QueueMem>, GuestPhysAddr) {
        let provider = Arc::new(FakeProvider {
            backing: std::sync::Mutex::new(vec![0u8; size as usize]),
        });
        let region = Arc::new(SimpleAS::new(Range::new(0, size), 0, AsCred::READ | AsCred::WRITE, provider));
        region.map_host().unwrap();
        let base = region.gpa_to_host(GuestPhysAddr(0)).unwrap();
        (Arc::new(QueueMem::new(vec![region])), GuestPhysAddr(base.0 as u64))
    }

    fn write_descriptor(mem: &QueueMem, desc_table: GuestPhysAddr, idx: u16, d: Descriptor) {
        let base = GuestPhysAddr(desc_table.0 + idx as u64 * 16);
        mem.write_bytes(base, &d.address.to_le_bytes()).unwrap();
        mem.write_bytes(GuestPhysAddr(base.0 + 8), &d.length.to_le_bytes()).unwrap();
        mem.write_bytes(GuestPhysAddr(base.0 + 12), &d.flags.to_le_bytes()).unwrap();
        mem.write_bytes(GuestPhysAddr(base.0 + 14), &d.next.to_le_bytes()).unwrap();
    }

    #[test]
    fn walk_single_descriptor_chain() {
        let (mem, host_base) = mem_with(0x10000);
        let desc_table = GuestPhysAddr(0);
        let avail = GuestPhysAddr(0x1000);
        let used = GuestPhysAddr(0x2000);
        let queue = DeviceQueue::new(mem.clone(), desc_table, avail, used, 4).unwrap();

        write_descriptor(
            &mem,
            desc_table,
            0,
            Descriptor {
                address: host_base.0 + 0x4000,
                length: 16,
                flags: DESC_F_WRITE,
                next: 0,
            },
        );
        mem.write_bytes(GuestPhysAddr(avail.0 + 4), &0u16.to_le_bytes()).unwrap();
        mem.write_bytes(GuestPhysAddr(avail.0 + 2), &1u16.to_le_bytes()).unwrap();

        let chain = walk_chain(&queue, None).unwrap();
        assert!(chain.complete);
        assert_eq!(chain.nodes.len(), 1);
        assert_eq!(chain.nodes[0].length, 16);
    }

    #[test]
    fn chain_length_bounded_by_queue_size() {
        let (mem, _host_base) = mem_with(0x10000);
        let desc_table = GuestPhysAddr(0);
        let queue = DeviceQueue::new(mem.clone(), desc_table, GuestPhysAddr(0x1000), GuestPhysAddr(0x2000), 2).unwrap();
        // A two-entry ring whose descriptors point at each other forever.
        write_descriptor(
            &mem,
            desc_table,
            0,
            Descriptor {
                address: 0,
                length: 4,
                flags: DESC_F_NEXT_FOR_TEST,
                next: 1,
            },
        );
        write_descriptor(
            &mem,
            desc_table,
            1,
            Descriptor {
                address: 0,
                length: 4,
                flags: DESC_F_NEXT_FOR_TEST,
                next: 0,
            },
        );
        assert!(matches!(
            walk_chain(&queue, Some(DescriptorHandle { index: 0 })),
            Err(DevError::NotRecoverable)
        ));
    }

    const DESC_F_NEXT_FOR_TEST: u16 = crate::virtio::queue::DESC_F_NEXT;

    struct IdentityAccessor;
    impl ChainAccessor for IdentityAccessor {
        fn translate(&self, gpa: GuestPhysAddr, _size: u64, _write: bool) -> DevResult<*mut u8> {
            Ok(gpa.0 as *mut u8)
        }
    }

    #[test]
    fn copy_into_writable_chain_tracks_prefix_written_bytes() {
        let (mem, host_base) = mem_with(0x10000);
        let desc_table = GuestPhysAddr(0);
        let avail = GuestPhysAddr(0x1000);
        let used = GuestPhysAddr(0x2000);
        let queue = DeviceQueue::new(mem.clone(), desc_table, avail, used, 4).unwrap();

        write_descriptor(
            &mem,
            desc_table,
            0,
            Descriptor {
                address: host_base.0 + 0x4000,
                length: 16,
                flags: DESC_F_WRITE,
                next: 0,
            },
        );
        mem.write_bytes(GuestPhysAddr(avail.0 + 4), &0u16.to_le_bytes()).unwrap();
        mem.write_bytes(GuestPhysAddr(avail.0 + 2), &1u16.to_le_bytes()).unwrap();

        let mut chain = walk_chain(&queue, None).unwrap();
        let mut src = [7u8; 10];
        let accessor = IdentityAccessor;
        let mut dst_buf = Buffer::Chain(&mut chain);
        let mut src_buf = Buffer::Linear(&mut src);
        let copied = copy(&accessor, &mut dst_buf, &mut src_buf, 10, false).unwrap();
        assert_eq!(copied, 10);
        assert_eq!(chain.nodes[0].prefix_written_bytes, 10);

        conclude_chain_use(&queue, &chain).unwrap();
        let used_len = {
            let mut buf = [0u8; 4];
            mem.read_bytes(GuestPhysAddr(used.0 + 4 + 4), &mut buf).unwrap();
            u32::from_le_bytes(buf)
        };
        assert_eq!(used_len, 10);
    }

    #[test]
    fn copy_into_read_only_chain_is_rejected() {
        let (mem, host_base) = mem_with(0x10000);
        let desc_table = GuestPhysAddr(0);
        let avail = GuestPhysAddr(0x1000);
        let used = GuestPhysAddr(0x2000);
        let queue = DeviceQueue::new(mem.clone(), desc_table, avail, used, 4).unwrap();
        write_descriptor(
            &mem,
            desc_table,
            0,
            Descriptor {
                address: host_base.0 + 0x4000,
                length: 16,
                flags: 0,
                next: 0,
            },
        );
        mem.write_bytes(GuestPhysAddr(avail.0 + 4), &0u16.to_le_bytes()).unwrap();
        mem.write_bytes(GuestPhysAddr(avail.0 + 2), &1u16.to_le_bytes()).unwrap();

        let mut chain = walk_chain(&queue, None).unwrap();
        let mut src = [7u8; 10];
        let accessor = IdentityAccessor;
        let mut dst_buf = Buffer::Chain(&mut chain);
        let mut src_buf = Buffer::Linear(&mut src);
        assert_eq!(
            copy(&accessor, &mut dst_buf, &mut src_buf, 10, false),
            Err(DevError::Permission)
        );
    }
}
