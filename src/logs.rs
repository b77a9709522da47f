use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use tracing::warn;

/// Returns the last `lines` lines of the log file at `log_path`.
///
/// A missing log file yields no lines.
pub fn tail_log(log_path: &Path, lines: usize) -> io::Result<Vec<String>> {
    if !log_path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(log_path)?;
    let reader = BufReader::new(file);
    let mut buffer: VecDeque<String> = VecDeque::with_capacity(lines.min(4096));

    for line in reader.lines().map_while(Result::ok) {
        if lines == 0 {
            break;
        }
        if buffer.len() == lines {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }

    Ok(buffer.into())
}

/// Reads and displays the last `lines` lines of a service's log file.
///
/// # Arguments
/// * `service_name` - The name of the service.
/// * `log_path` - The service's log file.
/// * `lines` - The number of log lines to display.
pub fn show_logs(service_name: &str, log_path: &Path, lines: usize) -> io::Result<()> {
    if !log_path.exists() {
        warn!(
            "Log file for service '{}' not found at {}",
            service_name,
            log_path.display()
        );
        return Ok(());
    }

    for line in tail_log(log_path, lines)? {
        println!("{}", line);
    }

    Ok(())
}
