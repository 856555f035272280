//! Explicit value channels.
//!
//! Register values the compiler decided to communicate travel over their own
//! queues rather than through memory. A channel connects two stages; it is
//! backed by one SPSC queue per (producer replica, consumer replica) pair.

use hashbrown::HashMap;

use crate::core::error::{RuntimeError, RuntimeResult};
use crate::pipeline::Topology;

use super::Queue;

/// A communicated value and the iteration that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ValueWord {
    pub iteration: u64,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub from_stage: usize,
    pub to_stage: usize,
}

pub struct ValueQueues {
    capacity: usize,
    channels: Vec<Channel>,
    queues: HashMap<(ChannelId, u32, u32), Queue<ValueWord>>,
}

impl ValueQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Vec::new(),
            queues: HashMap::new(),
        }
    }

    /// `create_queue`: a channel from every replica of `from_stage` to every
    /// replica of `to_stage`. Must run before workers are spawned.
    pub fn create_queue(
        &mut self,
        topology: &Topology,
        from_stage: usize,
        to_stage: usize,
    ) -> RuntimeResult<ChannelId> {
        if from_stage >= to_stage || to_stage >= topology.num_stages() {
            return Err(RuntimeError::InvalidTopology {
                reason: format!("value channel {from_stage} -> {to_stage} does not flow forward"),
            });
        }
        let id = ChannelId(self.channels.len() as u32);
        for from in topology.stage_workers(from_stage) {
            for to in topology.stage_workers(to_stage) {
                self.queues.insert((id, from, to), Queue::create(self.capacity)?);
            }
        }
        self.channels.push(Channel { from_stage, to_stage });
        log::debug!("value channel {} created: stage {from_stage} -> stage {to_stage}", id.0);
        Ok(id)
    }

    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.channels.get(id.0 as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn endpoint(&mut self, id: ChannelId, from: u32, to: u32) -> Option<&mut Queue<ValueWord>> {
        self.queues.get_mut(&(id, from, to))
    }

    /// Queues `wid` produces into.
    pub fn outgoing(&mut self, wid: u32) -> impl Iterator<Item = &mut Queue<ValueWord>> {
        self.queues
            .iter_mut()
            .filter(move |((_, from, _), _)| *from == wid)
            .map(|(_, q)| q)
    }

    /// Queues `wid` consumes from.
    pub fn incoming(&mut self, wid: u32) -> impl Iterator<Item = &mut Queue<ValueWord>> {
        self.queues
            .iter_mut()
            .filter(move |((_, _, to), _)| *to == wid)
            .map(|(_, q)| q)
    }

    /// `reset_queue` on every channel.
    pub fn reset(&mut self) {
        for queue in self.queues.values_mut() {
            queue.reset();
        }
    }
}
