// Montage Observability
// Process logging setup plus structured audit-event emission

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Web,
    Worker,
    Monitor,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Web => "web",
            ProcessKind::Worker => "worker",
            ProcessKind::Monitor => "monitor",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// One audit record: a step transition, a reconciliation tier firing,
/// or a provider attempt. Flat strings so the JSONL line is greppable
/// without a parser.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub project_id: Option<&'a str>,
    pub step: Option<u32>,
    pub job_id: Option<&'a str>,
    pub provider_id: Option<&'a str>,
    pub tier: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    // `tracing::event!` requires a const level, so dispatch per level.
    macro_rules! do_emit {
        ($lvl:expr) => {
            tracing::event!(
                target: "montage.obs",
                $lvl,
                process = process.as_str(),
                component = event.component,
                event = event.event,
                project_id = event.project_id.unwrap_or(""),
                step = event.step.unwrap_or(0),
                job_id = event.job_id.unwrap_or(""),
                provider_id = event.provider_id.unwrap_or(""),
                tier = event.tier.unwrap_or(""),
                status = event.status.unwrap_or(""),
                error_code = event.error_code.unwrap_or(""),
                detail = event.detail.unwrap_or(""),
                "observability_event"
            )
        };
    }
    match level {
        Level::TRACE => do_emit!(Level::TRACE),
        Level::DEBUG => do_emit!(Level::DEBUG),
        Level::INFO => do_emit!(Level::INFO),
        Level::WARN => do_emit!(Level::WARN),
        Level::ERROR => do_emit!(Level::ERROR),
    }
}

/// Install the process-wide subscriber: compact console layer plus a
/// daily-rolling JSONL file layer. Returns the appender guard; drop it
/// and buffered lines are lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process.as_str(), retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(format!("montage.{}", process.as_str()))
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix: format!("montage.{}", process.as_str()),
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, process: &str, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("montage.{}.", process);

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        // expected: montage.<proc>.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");

        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let raw = "sk-live-4f2c9a";
        let redacted = redact_text(raw);
        assert!(redacted.contains("[redacted len="));
        assert!(!redacted.contains("sk-live-4f2c9a"));
    }

    #[test]
    fn short_hash_is_stable() {
        assert_eq!(short_hash("abc"), short_hash("abc"));
        assert_ne!(short_hash("abc"), short_hash("abd"));
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/srv/montage");
        assert_eq!(
            canonical_logs_dir_from_root(&root),
            PathBuf::from("/srv/montage/logs")
        );
    }

    #[test]
    fn cleanup_removes_only_expired_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("montage.monitor.2020-01-01.jsonl");
        let recent_name = format!("montage.monitor.{}.jsonl", Utc::now().format("%Y-%m-%d"));
        let recent = dir.path().join(&recent_name);
        let unrelated = dir.path().join("montage.web.2020-01-01.jsonl");
        for path in [&old, &recent, &unrelated] {
            fs::write(path, b"{}\n").unwrap();
        }

        cleanup_old_jsonl(dir.path(), "monitor", 14).unwrap();

        assert!(!old.exists());
        assert!(recent.exists());
        // Other processes' files are out of scope for this cleanup.
        assert!(unrelated.exists());
    }
}
