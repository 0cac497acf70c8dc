use streams::CpuStat;

fn total(stat: &CpuStat) -> u64 {
    stat.user
        + stat.nice
        + stat.system
        + stat.idle
        + stat.iowait
        + stat.irq
        + stat.softirq
        + stat.steal
}

/// Busy percentage of each CPU between the first and the last snapshot.
/// Empty with fewer than two snapshots.
pub fn utilisation(rows: &[&[CpuStat]]) -> Vec<f64> {
    let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
        return Vec::new();
    };
    if rows.len() < 2 {
        return Vec::new();
    }

    first
        .iter()
        .zip(last.iter())
        .map(|(start, end)| {
            let elapsed = total(end).saturating_sub(total(start));
            if elapsed == 0 {
                return 0.0;
            }
            let idle = (end.idle + end.iowait).saturating_sub(start.idle + start.iowait);
            elapsed.saturating_sub(idle) as f64 * 100.0 / elapsed as f64
        })
        .collect()
}
