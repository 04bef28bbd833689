use crate::config::{AllocationStrategy, PortConfig, PortRange, ServiceKind};
use crate::error::{Error, Result};
use crate::lock_order::{LockId, OrderedMutex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Draws inside a preferred range before falling back to the whole pool.
const PREFERRED_DRAWS: usize = 16;

/// The binding a public port is allocated to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortOwner {
    pub container: String,
    pub service: ServiceKind,
}

impl PortOwner {
    pub fn new(container: impl Into<String>, service: ServiceKind) -> Self {
        Self {
            container: container.into(),
            service,
        }
    }
}

/// Free ports, indexed for the configured strategy.
#[derive(Debug)]
enum FreeSet {
    /// Lowest-first order for the sequential strategy
    Ordered(BTreeSet<u16>),
    /// Dense vector plus position index: O(1) uniform draw and O(1) removal
    Indexed {
        slots: Vec<u16>,
        index: HashMap<u16, usize>,
    },
}

impl FreeSet {
    fn new(strategy: AllocationStrategy, ports: impl Iterator<Item = u16>) -> Self {
        match strategy {
            AllocationStrategy::Sequential => FreeSet::Ordered(ports.collect()),
            AllocationStrategy::Random => {
                let slots: Vec<u16> = ports.collect();
                let index = slots.iter().enumerate().map(|(i, p)| (*p, i)).collect();
                FreeSet::Indexed { slots, index }
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            FreeSet::Ordered(set) => set.len(),
            FreeSet::Indexed { slots, .. } => slots.len(),
        }
    }

    #[cfg(test)]
    fn contains(&self, port: u16) -> bool {
        match self {
            FreeSet::Ordered(set) => set.contains(&port),
            FreeSet::Indexed { index, .. } => index.contains_key(&port),
        }
    }

    fn remove(&mut self, port: u16) -> bool {
        match self {
            FreeSet::Ordered(set) => set.remove(&port),
            FreeSet::Indexed { slots, index } => {
                let Some(pos) = index.remove(&port) else {
                    return false;
                };
                slots.swap_remove(pos);
                if let Some(moved) = slots.get(pos) {
                    index.insert(*moved, pos);
                }
                true
            }
        }
    }

    fn slot(&self, pos: usize) -> Option<u16> {
        match self {
            FreeSet::Ordered(_) => None,
            FreeSet::Indexed { slots, .. } => slots.get(pos).copied(),
        }
    }

    fn take(&mut self, prefer: &[PortRange]) -> Option<u16> {
        if let FreeSet::Ordered(set) = self {
            return set.pop_first();
        }

        let len = self.len();
        if len == 0 {
            return None;
        }
        let mut rng = rand::thread_rng();
        for range in prefer {
            for _ in 0..PREFERRED_DRAWS {
                let candidate = rng.gen_range(range.start..=range.end);
                if self.remove(candidate) {
                    return Some(candidate);
                }
            }
        }
        let port = self.slot(rng.gen_range(0..len))?;
        self.remove(port);
        Some(port)
    }
}

#[derive(Debug)]
struct PoolState {
    free: FreeSet,
    /// Released ports, oldest first. Handed out again only when `free` is empty.
    cooling: VecDeque<u16>,
    allocated: HashMap<u16, PortOwner>,
}

/// Public port pool.
///
/// Ports come from `[start, end]` minus the reserved set. A port is
/// allocated to at most one [`PortOwner`] at a time. Released ports go to
/// the back of a cooling queue rather than straight back into the free set,
/// so a container restarted after a stop receives fresh ports while any
/// never-used port remains.
///
/// # Thread Safety
///
/// State sits behind a single [`OrderedMutex`] (rank `ports`); every method
/// is O(1) on average except the sequential strategy's ordered set (O(log n)).
pub struct PortAllocator {
    range: PortRange,
    reserved: BTreeSet<u16>,
    prefer_ranges: Vec<PortRange>,
    strategy: AllocationStrategy,
    state: OrderedMutex<PoolState>,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortUsage {
    pub range_start: u16,
    pub range_end: u16,
    pub strategy: AllocationStrategy,
    pub total: usize,
    pub reserved: usize,
    pub allocated: usize,
    pub available: usize,
    pub cooling: usize,
    pub utilization_percent: f64,
    pub by_container: BTreeMap<String, BTreeMap<ServiceKind, u16>>,
}

impl PortAllocator {
    pub fn new(config: &PortConfig) -> Self {
        let range = config.range();
        let reserved: BTreeSet<u16> = config
            .reserved
            .iter()
            .copied()
            .filter(|p| range.contains(*p))
            .collect();
        let candidates = (range.start..=range.end).filter(|p| !reserved.contains(p));

        Self {
            range,
            prefer_ranges: config.prefer_ranges.clone(),
            strategy: config.strategy,
            state: OrderedMutex::new(
                LockId::Ports,
                PoolState {
                    free: FreeSet::new(config.strategy, candidates),
                    cooling: VecDeque::new(),
                    allocated: HashMap::new(),
                },
            ),
            reserved,
        }
    }

    /// Allocate a public port to `owner`.
    ///
    /// Fails with [`Error::ExhaustedPool`] and leaves the pool untouched when
    /// neither a free nor a cooling port remains.
    pub fn acquire(&self, owner: PortOwner) -> Result<u16> {
        let mut state = self.state.lock();
        let port = match state.free.take(&self.prefer_ranges) {
            Some(port) => port,
            None => state.cooling.pop_front().ok_or(Error::ExhaustedPool {
                start: self.range.start,
                end: self.range.end,
            })?,
        };

        tracing::debug!(
            port,
            container = %owner.container,
            service = %owner.service,
            "Allocated public port"
        );
        state.allocated.insert(port, owner);
        Ok(port)
    }

    /// Return a port to the pool. Releasing an unallocated port is a no-op.
    pub fn release(&self, port: u16) -> Option<PortOwner> {
        let mut state = self.state.lock();
        let owner = state.allocated.remove(&port)?;
        if self.range.contains(port) && !self.reserved.contains(&port) {
            state.cooling.push_back(port);
        }
        tracing::debug!(port, container = %owner.container, "Released public port");
        Some(owner)
    }

    /// Record an allocation recovered from persisted state.
    ///
    /// Ports outside the current range (the range may have shrunk since) are
    /// tracked as allocated so they are never double-booked, but never
    /// return to the pool.
    pub fn mark_allocated(&self, port: u16, owner: PortOwner) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.allocated.get(&port) {
            if *existing == owner {
                return Ok(());
            }
            return Err(Error::Conflict {
                name: owner.container.clone(),
                reason: format!(
                    "claims public port {} already bound to {}/{}",
                    port, existing.container, existing.service
                ),
            });
        }

        if !state.free.remove(port) {
            if let Some(pos) = state.cooling.iter().position(|p| *p == port) {
                state.cooling.remove(pos);
            } else if self.range.contains(port) && !self.reserved.contains(&port) {
                tracing::warn!(port, "Recovered port was neither free nor cooling");
            } else {
                tracing::warn!(
                    port,
                    container = %owner.container,
                    "Recovered port lies outside the configured pool"
                );
            }
        }
        state.allocated.insert(port, owner);
        Ok(())
    }

    pub fn owner_of(&self, port: u16) -> Option<PortOwner> {
        self.state.lock().allocated.get(&port).cloned()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.state.lock().allocated.contains_key(&port)
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    /// Ports that can still be handed out (free plus cooling).
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.free.len() + state.cooling.len()
    }

    pub fn allocated_ports(&self) -> BTreeSet<u16> {
        self.state.lock().allocated.keys().copied().collect()
    }

    pub fn usage(&self) -> PortUsage {
        let state = self.state.lock();
        let total = (self.range.end - self.range.start) as usize + 1;
        let reserved = self.reserved.len();
        let allocated = state.allocated.len();
        let usable = total - reserved;

        let mut by_container: BTreeMap<String, BTreeMap<ServiceKind, u16>> = BTreeMap::new();
        for (port, owner) in &state.allocated {
            by_container
                .entry(owner.container.clone())
                .or_default()
                .insert(owner.service, *port);
        }

        PortUsage {
            range_start: self.range.start,
            range_end: self.range.end,
            strategy: self.strategy,
            total,
            reserved,
            allocated,
            available: state.free.len() + state.cooling.len(),
            cooling: state.cooling.len(),
            utilization_percent: if usable == 0 {
                100.0
            } else {
                (allocated as f64 / usable as f64 * 10000.0).round() / 100.0
            },
            by_container,
        }
    }

    #[cfg(test)]
    fn is_free(&self, port: u16) -> bool {
        self.state.lock().free.contains(port)
    }
}
