use std::fs;
use std::io;
use std::path::PathBuf;

use log::{debug, warn};

/// Cumulative time of one CPU, in clock ticks
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuStat {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

/// Provides one `CpuStat` per CPU on request
pub trait CpuStatSource {
    fn n_cpus(&self) -> usize;

    /// Fills `out`, which holds `n_cpus` entries
    fn read(&mut self, out: &mut [CpuStat]) -> io::Result<()>;
}

/// Reads `/proc/stat`
pub struct ProcStat {
    path: PathBuf,
    n_cpus: usize,
}

impl ProcStat {
    pub fn new() -> io::Result<Self> {
        Self::with_path("/proc/stat")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let text = fs::read_to_string(&path)?;
        let n_cpus = text.lines().filter_map(parse_cpu_line).count();
        debug!("{}: {} CPUs", path.display(), n_cpus);
        Ok(Self { path, n_cpus })
    }
}

impl CpuStatSource for ProcStat {
    fn n_cpus(&self) -> usize {
        self.n_cpus
    }

    fn read(&mut self, out: &mut [CpuStat]) -> io::Result<()> {
        let text = fs::read_to_string(&self.path)?;
        parse_proc_stat(&text, out);
        Ok(())
    }
}

/// Parses the per-CPU lines of `/proc/stat` into `out` by CPU index.
/// Returns the number of lines that fit.
pub fn parse_proc_stat(text: &str, out: &mut [CpuStat]) -> usize {
    let mut filled = 0;
    for (cpu, stat) in text.lines().filter_map(parse_cpu_line) {
        if let Some(slot) = out.get_mut(cpu) {
            *slot = stat;
            filled += 1;
        }
    }
    filled
}

// "cpuN user nice system ...", skipping the aggregate "cpu" line
fn parse_cpu_line(line: &str) -> Option<(usize, CpuStat)> {
    let mut fields = line.split_whitespace();
    let cpu = fields.next()?.strip_prefix("cpu")?.parse().ok()?;

    let mut values = [0u64; 10];
    for value in values.iter_mut() {
        match fields.next() {
            Some(field) => *value = field.parse().ok()?,
            // Older kernels have fewer columns
            None => break,
        }
    }

    let [user, nice, system, idle, iowait, irq, softirq, steal, guest, guest_nice] = values;
    Some((
        cpu,
        CpuStat {
            user,
            nice,
            system,
            idle,
            iowait,
            irq,
            softirq,
            steal,
            guest,
            guest_nice,
        },
    ))
}

/// Periodic snapshots of per-CPU statistics kept in a row buffer.
///
/// Holds at least 10 rows, or one second's worth at the sampling period.
/// Once all rows are used the backend stops sampling, or in overwrite mode
/// starts again from the first row.
pub struct CpuBackend {
    source: Box<dyn CpuStatSource>,
    n_cpus: usize,
    n_rows: usize,
    rows: Vec<CpuStat>,
    pos: usize,
    full: bool,
    overwrite: bool,
}

impl CpuBackend {
    pub fn new(source: Box<dyn CpuStatSource>, period_ms: u64, overwrite: bool) -> Self {
        let n_cpus = source.n_cpus();
        let n_rows = 10.max((1000 / period_ms.max(1)) as usize);
        Self {
            source,
            n_cpus,
            n_rows,
            rows: vec![CpuStat::default(); n_rows * n_cpus],
            pos: 0,
            full: false,
            overwrite,
        }
    }

    /// Takes one snapshot into the next row
    pub fn sample(&mut self) {
        if self.pos < self.n_rows {
            let n_cpus = self.n_cpus;
            let row = &mut self.rows[self.pos * n_cpus..(self.pos + 1) * n_cpus];
            match self.source.read(row) {
                Ok(()) => self.pos += 1,
                Err(e) => warn!("failed to read CPU statistics: {}", e),
            }
        }

        if self.pos >= self.n_rows {
            if !self.full {
                debug!("CPU stats buffer full ({} rows)", self.n_rows);
            }
            self.full = true;
            if self.overwrite {
                self.pos = 0;
            }
        }
    }

    pub fn has_pending_data(&self) -> bool {
        self.pos != 0 || self.full
    }

    pub fn n_cpus(&self) -> usize {
        self.n_cpus
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Row the next snapshot goes to
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Set once every row has been written; never cleared
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Snapshots taken, oldest first
    pub fn rows(&self) -> Vec<&[CpuStat]> {
        let row = |i: usize| &self.rows[i * self.n_cpus..(i + 1) * self.n_cpus];
        match (self.full, self.overwrite) {
            (true, true) => (self.pos..self.n_rows).chain(0..self.pos).map(row).collect(),
            (true, false) => (0..self.n_rows).map(row).collect(),
            (false, _) => (0..self.pos).map(row).collect(),
        }
    }
}
