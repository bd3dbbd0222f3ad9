//! Lookup and erase on a host-laid-out open-chained hash table.
//!
//! The table keeps every node on one doubly linked list terminated by a
//! sentinel. Each bucket is a `[head, tail]` pair delimiting the bucket's run
//! on that list; an empty bucket points both ends at the sentinel.

use argon_config::log_pass_trace;
use argon_layout::{Address, Coordinate, HashTableLayout};

use crate::fault::LayoutFault;
use crate::host::CoordinateHasher;
use crate::memory::{all_or_nothing, ForeignMemory};

/// Opaque handle to a table node located by [`ForeignHashIndex::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle {
    node: Address,
    bucket: Address,
}

impl EntryHandle {
    pub fn node(&self) -> Address {
        self.node
    }

    pub fn bucket(&self) -> Address {
        self.bucket
    }
}

/// Writes that take one node out of a table, planned before any is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkPlan {
    entry: EntryHandle,
    prev: Address,
    next: Address,
    head_slot: Address,
    tail_slot: Address,
    new_head: Option<Address>,
    new_tail: Option<Address>,
    remaining: u64,
}

impl UnlinkPlan {
    pub fn entry(&self) -> &EntryHandle {
        &self.entry
    }

    /// Element count once the node is gone.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

/// Header fields read once per operation.
struct TableHeader {
    sentinel: Address,
    buckets: Address,
    bucket_count: u64,
    mask: u64,
}

/// A hash table somewhere in foreign memory, described by a layout.
pub struct ForeignHashIndex<'a> {
    name: &'static str,
    layout: &'a HashTableLayout,
    base: Address,
    walk_limit: u64,
}

impl<'a> ForeignHashIndex<'a> {
    /// Table at `root + layout.table_offset`.
    pub fn new(
        name: &'static str,
        layout: &'a HashTableLayout,
        root: Address,
        walk_limit: u64,
    ) -> Self {
        Self {
            name,
            layout,
            base: root.add(layout.table_offset),
            walk_limit,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> Address {
        self.base
    }

    /// Live element counter.
    pub fn len<M: ForeignMemory + ?Sized>(&self, mem: &M) -> Result<u64, LayoutFault> {
        mem.read_u64(self.base.add(self.layout.len_offset))
    }

    /// Address of the node's mapped value.
    pub fn value_address(&self, entry: &EntryHandle) -> Address {
        entry.node.add(self.layout.node_value_offset)
    }

    pub fn key_of<M: ForeignMemory + ?Sized>(
        &self,
        mem: &M,
        node: Address,
    ) -> Result<Coordinate, LayoutFault> {
        mem.read_coordinate(node.add(self.layout.node_key_offset))
    }

    fn header<M: ForeignMemory + ?Sized>(&self, mem: &M) -> Result<TableHeader, LayoutFault> {
        let layout = self.layout;
        let sentinel = mem.read_ptr(self.base.add(layout.sentinel_offset), "table sentinel")?;
        let buckets = mem.read_ptr(self.base.add(layout.buckets_offset), "bucket array")?;
        let buckets_end = mem.read_ptr(
            self.base.add(layout.buckets_end_offset),
            "bucket array end",
        )?;
        let mask = mem.read_u64(self.base.add(layout.mask_offset))?;

        let span = buckets_end
            .distance_from(buckets)
            .ok_or(LayoutFault::BrokenLink {
                what: "bucket array bounds",
                node: buckets_end,
            })?;
        Ok(TableHeader {
            sentinel,
            buckets,
            bucket_count: span / layout.bucket_stride,
            mask,
        })
    }

    /// Find the node holding `key`.
    ///
    /// The bucket is walked from its tail towards its head over `prev`
    /// links; the head itself is compared last.
    pub fn lookup<M, H>(
        &self,
        mem: &M,
        hasher: &H,
        key: Coordinate,
    ) -> Result<Option<EntryHandle>, LayoutFault>
    where
        M: ForeignMemory + ?Sized,
        H: CoordinateHasher + ?Sized,
    {
        let layout = self.layout;
        let header = self.header(mem)?;

        let index = hasher.hash(key) & header.mask;
        if index >= header.bucket_count {
            return Err(LayoutFault::BucketOutOfRange {
                what: self.name,
                index,
                buckets: header.bucket_count,
            });
        }
        let bucket = header.buckets.add(index * layout.bucket_stride);
        let head = mem.read_addr(bucket.add(layout.bucket_head_offset))?;
        if head.is_null() || head == header.sentinel {
            return Ok(None);
        }
        let tail = mem.read_addr(bucket.add(layout.bucket_tail_offset))?;

        let mut cur = tail;
        let mut steps = 0u64;
        while cur != head {
            if cur.is_null() || cur == header.sentinel {
                return Err(LayoutFault::BrokenLink {
                    what: self.name,
                    node: cur,
                });
            }
            if self.key_of(mem, cur)? == key {
                return Ok(Some(EntryHandle { node: cur, bucket }));
            }
            steps += 1;
            if steps > self.walk_limit {
                return Err(LayoutFault::RunawayChain {
                    what: self.name,
                    limit: self.walk_limit,
                });
            }
            cur = mem.read_ptr(cur.add(layout.node_prev_offset), "chain prev link")?;
        }

        // Single-node buckets have head == tail and skip the loop entirely.
        if self.key_of(mem, head)? == key {
            return Ok(Some(EntryHandle { node: head, bucket }));
        }
        Ok(None)
    }

    /// Gather and cross-check everything needed to unlink `entry`, without
    /// writing anything.
    pub fn plan_unlink<M: ForeignMemory + ?Sized>(
        &self,
        mem: &M,
        entry: &EntryHandle,
    ) -> Result<UnlinkPlan, LayoutFault> {
        let layout = self.layout;
        let node = entry.node;
        let header = self.header(mem)?;

        let next = mem.read_ptr(node.add(layout.node_next_offset), "node next link")?;
        let prev = mem.read_ptr(node.add(layout.node_prev_offset), "node prev link")?;
        if mem.read_addr(prev.add(layout.node_next_offset))? != node
            || mem.read_addr(next.add(layout.node_prev_offset))? != node
        {
            return Err(LayoutFault::BrokenLink {
                what: self.name,
                node,
            });
        }
        let head_slot = entry.bucket.add(layout.bucket_head_offset);
        let tail_slot = entry.bucket.add(layout.bucket_tail_offset);
        let head = mem.read_addr(head_slot)?;
        let tail = mem.read_addr(tail_slot)?;
        let remaining = self
            .len(mem)?
            .checked_sub(1)
            .ok_or(LayoutFault::CounterUnderflow { what: self.name })?;

        let (new_head, new_tail) = match (head == node, tail == node) {
            (true, true) => (Some(header.sentinel), Some(header.sentinel)),
            (true, false) => (Some(next), None),
            (false, true) => (None, Some(prev)),
            (false, false) => (None, None),
        };
        Ok(UnlinkPlan {
            entry: *entry,
            prev,
            next,
            head_slot,
            tail_slot,
            new_head,
            new_tail,
            remaining,
        })
    }

    /// Apply `plan`: the element counter first, then the splice.
    ///
    /// Run it inside [`all_or_nothing`] so a failed write leaves the table
    /// as it was.
    pub fn unlink<M: ForeignMemory + ?Sized>(
        &self,
        mem: &mut M,
        plan: &UnlinkPlan,
    ) -> Result<(), LayoutFault> {
        let layout = self.layout;
        mem.write_u64(self.base.add(layout.len_offset), plan.remaining)?;
        if let Some(head) = plan.new_head {
            mem.write_addr(plan.head_slot, head)?;
        }
        if let Some(tail) = plan.new_tail {
            mem.write_addr(plan.tail_slot, tail)?;
        }
        mem.write_addr(plan.prev.add(layout.node_next_offset), plan.next)?;
        mem.write_addr(plan.next.add(layout.node_prev_offset), plan.prev)?;
        Ok(())
    }

    /// Free an unlinked node. `release_value` runs first, with the address
    /// of the mapped value.
    pub fn release_node<M, F>(
        &self,
        mem: &mut M,
        plan: &UnlinkPlan,
        release_value: F,
    ) -> Result<(), LayoutFault>
    where
        M: ForeignMemory + ?Sized,
        F: FnOnce(&mut M, Address) -> Result<(), LayoutFault>,
    {
        release_value(mem, self.value_address(&plan.entry))?;
        mem.release(plan.entry.node, self.layout.node_size)?;
        log_pass_trace!(
            "Erased table node",
            table = self.name,
            node = tracing::field::display(plan.entry.node),
            remaining = plan.remaining,
        );
        Ok(())
    }

    /// Unlink and free the node holding `key`. Returns false if absent.
    ///
    /// The unlink either lands completely or not at all; `release_value`
    /// runs after it, before the node itself is freed.
    pub fn erase<M, H, F>(
        &self,
        mem: &mut M,
        hasher: &H,
        key: Coordinate,
        release_value: F,
    ) -> Result<bool, LayoutFault>
    where
        M: ForeignMemory + ?Sized,
        H: CoordinateHasher + ?Sized,
        F: FnOnce(&mut M, Address) -> Result<(), LayoutFault>,
    {
        let Some(entry) = self.lookup(mem, hasher, key)? else {
            return Ok(false);
        };
        let plan = self.plan_unlink(mem, &entry)?;
        all_or_nothing(mem, |mem| self.unlink(mem, &plan))?;
        self.release_node(mem, &plan, release_value)?;
        Ok(true)
    }
}
