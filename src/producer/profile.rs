use anyhow::{Context, Result};

/// Labels supplied for profile results, in the order the sampler emits
/// fields.
pub const PROFILE_LABELS: [&str; 9] = [
    "State",
    "Age (s)",
    "Threads",
    "CPU Usage (%)",
    "Resident Memory (GB)",
    "Virtual Memory (GB)",
    "Swap (GB)",
    "IO Read (MB)",
    "IO Write (MB)",
];

/// Maps single-character process state codes to human-readable strings.
fn state_name(code: &str) -> &str {
    match code {
        "D" => "uninterruptable sleep",
        "I" => "idle",
        "R" => "running",
        "S" => "sleeping",
        "T" => "stopped via signal",
        "t" => "stopped via debugger",
        "Z" => "zombie",
        other => other,
    }
}

/// Samples process statistics for a fixed PID from /proc.
///
/// Each tick reads stat, status, and io for the process plus the system
/// uptime, and formats one space-separated row in `PROFILE_LABELS` order.
/// Read failures are reported to the caller, which logs and carries on.
pub struct ProfileExecutor;

impl ProfileExecutor {
    pub async fn execute(&self, query: &str) -> Result<Option<String>> {
        let pid: i64 = query
            .trim()
            .parse()
            .with_context(|| format!("profile query {query:?} is not a process id"))?;

        Ok(Some(sample(pid)?))
    }
}

#[cfg(target_os = "linux")]
fn sample(pid: i64) -> Result<String> {
    use std::fs;

    let stat_raw = fs::read_to_string(format!("/proc/{pid}/stat"))
        .with_context(|| format!("reading /proc/{pid}/stat"))?;
    let stat = parse_stat(&stat_raw).with_context(|| format!("parsing /proc/{pid}/stat"))?;

    let uptime_raw = fs::read_to_string("/proc/uptime").context("reading /proc/uptime")?;
    let uptime = parse_uptime(&uptime_raw).context("parsing /proc/uptime")?;

    // Swap and io are best-effort: both files can be absent or restricted.
    let swap_kb = fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|s| parse_status_swap_kb(&s))
        .unwrap_or(0);

    let (io_read, io_write) = fs::read_to_string(format!("/proc/{pid}/io"))
        .ok()
        .and_then(|s| parse_io(&s))
        .unwrap_or((0, 0));

    Ok(format_row(&stat, uptime, swap_kb, io_read, io_write))
}

#[cfg(not(target_os = "linux"))]
fn sample(_pid: i64) -> Result<String> {
    anyhow::bail!("process profiling via /proc is only supported on Linux")
}

/// Fields extracted from /proc/<pid>/stat.
#[derive(Debug, PartialEq)]
struct StatFields {
    state: String,
    utime_ticks: u64,
    stime_ticks: u64,
    num_threads: i64,
    starttime_ticks: u64,
    vsize_bytes: u64,
    rss_pages: i64,
}

/// Parses /proc/<pid>/stat, splitting after the parenthesised comm so
/// process names containing spaces cannot shift fields.
fn parse_stat(raw: &str) -> Option<StatFields> {
    let rest = raw.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // fields[0] is the state (field 3 of the file); later indexes follow
    // the proc(5) numbering offset by 3.
    Some(StatFields {
        state: fields.first()?.to_string(),
        utime_ticks: fields.get(11)?.parse().ok()?,
        stime_ticks: fields.get(12)?.parse().ok()?,
        num_threads: fields.get(17)?.parse().ok()?,
        starttime_ticks: fields.get(19)?.parse().ok()?,
        vsize_bytes: fields.get(20)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}

/// Parses the first token of /proc/uptime: total system uptime in seconds.
fn parse_uptime(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

/// Extracts the VmSwap value (in kB) from /proc/<pid>/status.
fn parse_status_swap_kb(raw: &str) -> Option<u64> {
    raw.lines()
        .find(|line| line.starts_with("VmSwap:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Extracts read_bytes and write_bytes from /proc/<pid>/io.
fn parse_io(raw: &str) -> Option<(u64, u64)> {
    let mut read_bytes = None;
    let mut write_bytes = None;

    for line in raw.lines() {
        if let Some(v) = line.strip_prefix("read_bytes:") {
            read_bytes = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("write_bytes:") {
            write_bytes = v.trim().parse().ok();
        }
    }

    Some((read_bytes?, write_bytes?))
}

/// Formats the sampled fields in `PROFILE_LABELS` order. Byte counts use
/// decimal units (GB = 1e9, MB = 1e6).
fn format_row(stat: &StatFields, uptime: f64, swap_kb: u64, io_read: u64, io_write: u64) -> String {
    let hz = clock_ticks_per_second();
    let page_size = page_size_bytes();

    let age_secs = (uptime - stat.starttime_ticks as f64 / hz).max(0.0) as i64;
    let cpu_secs = (stat.utime_ticks + stat.stime_ticks) as f64 / hz;
    let cpu_pct = if uptime > 0.0 {
        (cpu_secs / uptime) * 100.0
    } else {
        0.0
    };

    let rss_gb = stat.rss_pages.max(0) as f64 * page_size / 1e9;
    let virt_gb = stat.vsize_bytes as f64 / 1e9;
    let swap_gb = swap_kb as f64 * 1024.0 / 1e9;

    format!(
        "{} {} {} {} {} {} {} {} {}",
        state_name(&stat.state),
        age_secs,
        stat.num_threads,
        cpu_pct,
        rss_gb,
        virt_gb,
        swap_gb,
        io_read as f64 / 1e6,
        io_write as f64 / 1e6,
    )
}

fn clock_ticks_per_second() -> f64 {
    // SAFETY: sysconf is thread-safe and takes no pointers.
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as f64
    } else {
        100.0
    }
}

fn page_size_bytes() -> f64 {
    // SAFETY: sysconf is thread-safe and takes no pointers.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as f64
    } else {
        4096.0
    }
}
