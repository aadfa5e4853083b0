use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoutineLogKind {
    ManagerPing,
    RegistryCleanup,
    SessionPing,
    WorkerHealth,
}

impl RoutineLogKind {
    fn interval(self) -> Duration {
        match self {
            RoutineLogKind::ManagerPing => Duration::from_secs(30),
            RoutineLogKind::RegistryCleanup => Duration::from_secs(30),
            RoutineLogKind::SessionPing => Duration::from_secs(60),
            RoutineLogKind::WorkerHealth => Duration::from_secs(15),
        }
    }
}

#[derive(PartialEq, Eq, Hash)]
struct LogKey {
    kind: RoutineLogKind,
    subject: String,
}

static ROUTINE_LOG_MEMORY: Lazy<Mutex<HashMap<LogKey, Instant>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Rate-limits warnings emitted from background loops, per kind and subject.
pub fn should_log_routine_failure(kind: RoutineLogKind, subject: &str) -> bool {
    let mut guard = ROUTINE_LOG_MEMORY.lock();
    let key = LogKey {
        kind,
        subject: subject.to_string(),
    };
    let now = Instant::now();
    if let Some(last) = guard.get(&key) {
        if now.duration_since(*last) < kind.interval() {
            return false;
        }
    }
    guard.insert(key, now);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_repeats_within_interval() {
        assert!(should_log_routine_failure(RoutineLogKind::WorkerHealth, "w-throttle"));
        assert!(!should_log_routine_failure(RoutineLogKind::WorkerHealth, "w-throttle"));
        assert!(should_log_routine_failure(RoutineLogKind::WorkerHealth, "w-other"));
    }
}
