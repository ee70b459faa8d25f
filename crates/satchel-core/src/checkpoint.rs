use std::collections::BTreeMap;

/// Named byte-count snapshots recorded during a run (peak buffer sizes,
/// bytes streamed per phase). Owned by the caller that drives the run;
/// there is no process-global checkpoint state.
#[derive(Debug, Default)]
pub struct MemoryCheckpoints {
    points: BTreeMap<String, u64>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value, keeping the maximum seen for the name.
    pub fn record_peak(&mut self, name: &str, bytes: u64) {
        let entry = self.points.entry(name.to_string()).or_insert(0);
        *entry = (*entry).max(bytes);
    }

    /// Record a value, overwriting any previous one.
    pub fn record(&mut self, name: &str, bytes: u64) {
        self.points.insert(name.to_string(), bytes);
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.points.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.points.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
