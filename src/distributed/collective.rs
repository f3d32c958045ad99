//! Collective communication backends

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};

/// Blocking collective operations over a fixed group of workers
///
/// Every worker of the group must call the same operations in the same order.
pub trait Collective: Send {
    /// Index of this worker in the group
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise sum over all workers, written back into `data`
    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<()>;

    /// Overwrite `data` with the values held by worker `root`
    fn broadcast(&self, data: &mut [f32], root: usize) -> Result<()>;

    /// Every worker's `values`, indexed by rank
    fn all_gather(&self, values: &[usize]) -> Result<Vec<Vec<usize>>>;
}

/// Group of one: every collective is the identity
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _data: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _data: &mut [f32], root: usize) -> Result<()> {
        if root != 0 {
            return Err(Error::Collective(format!("broadcast root {root} outside a group of 1")));
        }
        Ok(())
    }

    fn all_gather(&self, values: &[usize]) -> Result<Vec<Vec<usize>>> {
        Ok(vec![values.to_vec()])
    }
}

struct Shared {
    barrier: Barrier,
    floats: Mutex<Vec<Vec<f32>>>,
    indices: Mutex<Vec<Vec<usize>>>,
}

/// In-process group of workers running on separate threads
///
/// Each collective publishes into a shared slot, waits on a barrier, reads
/// every slot and waits again before the slots can be reused.
pub struct ThreadGroup;

impl ThreadGroup {
    /// One handle per worker; move each into its thread
    pub fn spawn(world_size: usize) -> Vec<ThreadWorker> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            floats: Mutex::new(vec![Vec::new(); world_size]),
            indices: Mutex::new(vec![Vec::new(); world_size]),
        });
        (0..world_size)
            .map(|rank| ThreadWorker {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// A worker's handle into a [`ThreadGroup`]
pub struct ThreadWorker {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl ThreadWorker {
    fn publish_floats(&self, data: &[f32]) {
        self.shared.floats.lock()[self.rank] = data.to_vec();
        self.shared.barrier.wait();
    }

    fn release(&self) {
        self.shared.barrier.wait();
    }
}

impl std::fmt::Debug for ThreadWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadWorker")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl Collective for ThreadWorker {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<()> {
        self.publish_floats(data);
        let result = {
            let slots = self.shared.floats.lock();
            if slots.iter().any(|s| s.len() != data.len()) {
                Err(Error::Collective(format!(
                    "all_reduce over mismatched lengths {:?}",
                    slots.iter().map(Vec::len).collect::<Vec<_>>()
                )))
            } else {
                data.fill(0.0);
                for slot in slots.iter() {
                    for (d, v) in data.iter_mut().zip(slot) {
                        *d += v;
                    }
                }
                Ok(())
            }
        };
        self.release();
        result
    }

    fn broadcast(&self, data: &mut [f32], root: usize) -> Result<()> {
        if root >= self.world_size {
            return Err(Error::Collective(format!(
                "broadcast root {root} outside a group of {}",
                self.world_size
            )));
        }
        self.publish_floats(data);
        let result = {
            let slots = self.shared.floats.lock();
            if slots[root].len() == data.len() {
                data.copy_from_slice(&slots[root]);
                Ok(())
            } else {
                Err(Error::Collective(format!(
                    "broadcast of {} values into a buffer of {}",
                    slots[root].len(),
                    data.len()
                )))
            }
        };
        self.release();
        result
    }

    fn all_gather(&self, values: &[usize]) -> Result<Vec<Vec<usize>>> {
        self.shared.indices.lock()[self.rank] = values.to_vec();
        self.shared.barrier.wait();
        let gathered = self.shared.indices.lock().clone();
        self.release();
        Ok(gathered)
    }
}
