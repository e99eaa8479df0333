use std::env;
use std::time::Duration;

/// Runtime configuration for the scheduler and reaper loops, plus the
/// gateways to seed the registry with on boot.
///
/// Reads from the environment, falling back to documented defaults when a
/// variable is unset or malformed.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Reaper trigger: how long a claimed/running lock may sit before it's
    /// considered stale.
    pub task_lock_ttl: Duration,
    /// Scheduler sleep between empty-queue polls.
    pub scheduler_poll_interval: Duration,
    /// Reaper scan interval.
    pub reaper_poll_interval: Duration,
    /// Initial gateway hosts to register with the in-memory registry on boot.
    pub gateway_urls: Vec<String>,
}

impl ControlConfig {
    pub const DEFAULT_TASK_LOCK_TTL_SECONDS: i64 = 300;
    pub const DEFAULT_SCHEDULER_POLL_SECONDS: f64 = 1.5;
    pub const DEFAULT_REAPER_POLL_SECONDS: f64 = 15.0;

    pub fn from_env() -> Self {
        let task_lock_ttl = env::var("CONTROL_TASK_LOCK_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(Self::DEFAULT_TASK_LOCK_TTL_SECONDS);

        let scheduler_poll_interval = env::var("CONTROL_SCHEDULER_POLL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v > 0.0)
            .unwrap_or(Self::DEFAULT_SCHEDULER_POLL_SECONDS);

        let reaper_poll_interval = env::var("CONTROL_REAPER_POLL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v > 0.0)
            .unwrap_or(Self::DEFAULT_REAPER_POLL_SECONDS);

        let gateway_urls = env::var("GATEWAY_URLS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_owned())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            task_lock_ttl: Duration::from_secs(task_lock_ttl.max(0) as u64),
            scheduler_poll_interval: Duration::from_secs_f64(scheduler_poll_interval),
            reaper_poll_interval: Duration::from_secs_f64(reaper_poll_interval),
            gateway_urls,
        }
    }

    pub fn task_lock_ttl_seconds(&self) -> i64 {
        self.task_lock_ttl.as_secs() as i64
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ControlConfig {
            task_lock_ttl: Duration::from_secs(300),
            scheduler_poll_interval: Duration::from_secs_f64(1.5),
            reaper_poll_interval: Duration::from_secs_f64(15.0),
            gateway_urls: vec![],
        };
        assert_eq!(cfg.task_lock_ttl_seconds(), 300);
        assert_eq!(cfg.scheduler_poll_interval, Duration::from_millis(1500));
    }

    #[test]
    fn gateway_urls_split_and_trim() {
        unsafe {
            env::set_var("GATEWAY_URLS", " http://a:1 , http://b:2,,");
        }
        let cfg = ControlConfig::from_env();
        assert_eq!(cfg.gateway_urls, vec!["http://a:1", "http://b:2"]);
        unsafe {
            env::remove_var("GATEWAY_URLS");
        }
    }
}
