//! Per-syscall call counts and timings.
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::table::SyscallName;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyscallStats {
  pub calls: u64,
  pub total_us: u64,
}

impl SyscallStats {
  pub fn record(&mut self, elapsed: Duration) {
    self.calls += 1;
    self.total_us += elapsed.as_micros() as u64;
  }

  pub fn average_us(&self) -> f64 {
    if self.calls == 0 {
      return 0.0;
    }
    self.total_us as f64 / self.calls as f64
  }
}

/// Stats keyed by syscall number. Only completed (entry and exit) invocations are recorded.
#[derive(Debug, Default)]
pub struct StatsTable {
  entries: BTreeMap<u64, (SyscallName, SyscallStats)>,
}

impl StatsTable {
  pub fn record(&mut self, number: u64, name: SyscallName, elapsed: Duration) {
    self
      .entries
      .entry(number)
      .or_insert((name, SyscallStats::default()))
      .1
      .record(elapsed);
  }

  pub fn get(&self, number: u64) -> Option<SyscallStats> {
    self.entries.get(&number).map(|(_, stats)| *stats)
  }

  pub fn distinct(&self) -> usize {
    self.entries.len()
  }

  pub fn summary(&self) -> Summary {
    Summary {
      rows: self
        .entries
        .iter()
        .map(|(number, (name, stats))| SummaryRow {
          number: *number,
          name: *name,
          stats: *stats,
        })
        .collect(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
  pub number: u64,
  pub name: SyscallName,
  pub stats: SyscallStats,
}

impl fmt::Display for SummaryRow {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{:<20} (#{}): {} calls, total: {} us, avg: {:.2} us",
      self.name.as_str(),
      self.number,
      self.stats.calls,
      self.stats.total_us,
      self.stats.average_us()
    )
  }
}

/// The end-of-run table, ordered by syscall number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
  pub rows: Vec<SummaryRow>,
}

impl Summary {
  pub fn distinct(&self) -> usize {
    self.rows.len()
  }
}

impl fmt::Display for Summary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "===== syscall summary =====")?;
    for row in &self.rows {
      writeln!(f, "{row}")?;
    }
    writeln!(f)?;
    writeln!(f, "{} distinct syscalls recorded", self.distinct())
  }
}
