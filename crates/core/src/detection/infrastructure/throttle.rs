use std::collections::HashMap;

/// Monotonic call counter gating expensive stages to every Nth call.
///
/// Counting is 1-based: with interval N the gate opens on calls
/// {N, 2N, 3N, …}. Callers force a compute regardless of phase when they
/// have nothing cached yet, so a first call never returns empty-handed.
#[derive(Debug)]
pub struct ThrottleCounter {
    interval: u64,
    calls: u64,
}

impl ThrottleCounter {
    /// Intervals below 1 collapse to 1 (compute every call).
    pub fn new(interval: u32) -> Self {
        Self {
            interval: u64::from(interval.max(1)),
            calls: 0,
        }
    }

    /// Registers a call; true when this call is on the compute phase.
    pub fn tick(&mut self) -> bool {
        self.calls += 1;
        self.calls % self.interval == 0
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

/// Last computed value per spatial identity (bbox corner key).
///
/// A missing key is the signal to compute immediately even off the
/// throttle phase.
#[derive(Debug, Default)]
pub struct SpatialCache<T> {
    entries: HashMap<String, T>,
}

impl<T> SpatialCache<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn lookup(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn store(&mut self, key: String, value: T) {
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
