use colored::*;
use pickaxe_core::MinerStats;
use std::time::Duration;

/// One-line banner printed before `pickaxe run`
pub fn show_compact_banner() {
    println!(
        "{} {}",
        "⛏ Pickaxe".bright_cyan().bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).bright_black()
    );
}

/// Startup summary for a mining run
pub fn show_run_summary(url: &str, user: &str, protocol: &str, threads: usize) {
    println!();
    println!("  {} {}", "Pool:".bold(), url.cyan());
    println!("  {} {}", "Worker:".bold(), user.white());
    println!("  {} {}", "Protocol:".bold(), protocol.yellow());
    println!("  {} {}", "Threads:".bold(), threads.to_string().bright_yellow());
    println!();
}

/// Totals printed after the run loop ends
pub fn show_final_stats(stats: &MinerStats) {
    println!();
    println!("{}", "Mining Summary:".bold());
    println!("  Uptime: {}", format_duration(stats.uptime));
    println!("  Sessions: {}", stats.sessions);
    println!("  Jobs: {}", stats.jobs_received);
    println!("  Hashrate: {}", format_hashrate(stats.hashrate()).bright_cyan());
    println!(
        "  Shares: {} submitted, {} accepted, {} rejected, {} stale",
        stats.shares_submitted,
        stats.shares_accepted.to_string().green(),
        stats.shares_rejected.to_string().red(),
        stats.shares_stale.to_string().yellow()
    );
    if stats.pool.shares_dropped > 0 {
        println!(
            "  {} {} shares dropped on a full queue",
            "⚠".yellow(),
            stats.pool.shares_dropped
        );
    }
}

pub fn format_hashrate(hashes_per_sec: f64) -> String {
    const UNITS: [&str; 5] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s"];
    let mut value = hashes_per_sec;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hashrate() {
        assert_eq!(format_hashrate(0.0), "0.00 H/s");
        assert_eq!(format_hashrate(1_500.0), "1.50 KH/s");
        assert_eq!(format_hashrate(2_000_000.0), "2.00 MH/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
