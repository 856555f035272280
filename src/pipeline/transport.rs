//! Every packet queue and chunk pool of one invocation.
//!
//! Queues exist for each ordered pair of processes that talk: a worker to each
//! worker of a later stage and to its own stage's other replicas, every worker
//! to every try-commit, every try-commit to commit, and commit back to every
//! worker. Workers and try-commits each own a chunk pool.

use crate::core::config::RuntimeConfig;
use crate::core::error::{RuntimeError, RuntimeResult};
use crate::packet::{ChunkPool, Packet};
use crate::queue::Queue;

use super::Topology;

pub struct Transport {
    nodes: usize,
    links: Vec<Option<Queue<Packet>>>,
    pools: Vec<Option<ChunkPool>>,
}

impl Transport {
    pub fn new(topology: &Topology, config: &RuntimeConfig) -> RuntimeResult<Self> {
        let nodes = topology.nodes();
        let commit = topology.commit_node();
        let mut links: Vec<Option<Queue<Packet>>> = (0..nodes * nodes).map(|_| None).collect();
        let mut pools = Vec::with_capacity(nodes);

        let mut pairs = Vec::new();
        for wid in 0..topology.workers() as u32 {
            pairs.extend(topology.downstream_of(wid).map(|to| (wid, to)));
            pairs.extend(topology.peers_of(wid).map(|to| (wid, to)));
            pairs.extend(topology.try_commit_nodes().map(|tc| (wid, tc)));
            pairs.push((commit, wid));
        }
        for tc in topology.try_commit_nodes() {
            pairs.push((tc, commit));
        }
        for &(from, to) in &pairs {
            links[from as usize * nodes + to as usize] = Some(Queue::create(config.queue_capacity)?);
        }

        for node in 0..nodes as u32 {
            pools.push(if node == commit {
                None
            } else {
                Some(ChunkPool::new(config.chunk_pool_size)?)
            });
        }

        log::debug!(
            "transport: {} queues of {} packets, {} chunk pools",
            pairs.len(),
            config.queue_capacity,
            nodes - 1
        );
        Ok(Self { nodes, links, pools })
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    pub fn has_link(&self, from: u32, to: u32) -> bool {
        self.index(from, to).is_some_and(|i| self.links[i].is_some())
    }

    fn index(&self, from: u32, to: u32) -> Option<usize> {
        let (from, to) = (from as usize, to as usize);
        (from < self.nodes && to < self.nodes).then_some(from * self.nodes + to)
    }

    pub fn link(&mut self, from: u32, to: u32) -> RuntimeResult<&mut Queue<Packet>> {
        self.index(from, to)
            .and_then(|i| self.links[i].as_mut())
            .ok_or_else(|| missing_link(from, to))
    }

    pub fn pool(&self, node: u32) -> RuntimeResult<&ChunkPool> {
        self.pools
            .get(node as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| missing_pool(node))
    }

    pub fn pool_mut(&mut self, node: u32) -> RuntimeResult<&mut ChunkPool> {
        self.pools
            .get_mut(node as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| missing_pool(node))
    }

    /// Publish everything `node` has produced.
    pub fn flush_from(&mut self, node: u32) {
        let nodes = self.nodes;
        let start = node as usize * nodes;
        for queue in self.links[start..start + nodes].iter_mut().flatten() {
            queue.flush();
        }
    }

    /// Close every queue `node` consumes from.
    pub fn close_into(&mut self, node: u32) {
        let nodes = self.nodes;
        for from in 0..nodes {
            if let Some(queue) = self.links[from * nodes + node as usize].as_mut() {
                queue.close();
            }
        }
    }

    /// `reset_queue` on every queue and free every chunk. All children must be gone.
    pub fn reset(&mut self) {
        for queue in self.links.iter_mut().flatten() {
            queue.reset();
        }
        for pool in self.pools.iter_mut().flatten() {
            pool.reset();
        }
    }
}

fn missing_link(from: u32, to: u32) -> RuntimeError {
    RuntimeError::InvalidTopology {
        reason: format!("no queue from node {from} to node {to}"),
    }
}

fn missing_pool(node: u32) -> RuntimeError {
    RuntimeError::InvalidTopology {
        reason: format!("node {node} owns no chunk pool"),
    }
}
