//! 后端端点注册表
//!
//! 按优先级保存候选端点及其健康标记。健康标记只是建议：冷却期过后或
//! 首次成功后自动恢复，候选全部疑似故障时仍会返回端点，保证任务能继续推进。

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 默认冷却时间
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct EndpointState {
    url: String,
    priority: u32,
    /// 疑似故障的起始时间
    suspected_since: Option<Instant>,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
}

impl EndpointState {
    fn is_suspected(&self, now: Instant, cooldown: Duration) -> bool {
        self.suspected_since
            .is_some_and(|since| now.duration_since(since) < cooldown)
    }
}

/// 端点状态快照
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub url: String,
    pub priority: u32,
    pub suspected_down: bool,
    /// 距离自动恢复的剩余秒数
    pub cooldown_remaining_secs: Option<u64>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
}

/// 端点注册表，进程内共享，所有状态由一把锁保护
#[derive(Debug)]
pub struct EndpointRegistry {
    /// 已按优先级排序（同优先级保持配置顺序）
    endpoints: Mutex<Vec<EndpointState>>,
    cooldown: Duration,
}

impl EndpointRegistry {
    pub fn new(candidates: Vec<(String, u32)>) -> Self {
        Self::with_cooldown(candidates, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(candidates: Vec<(String, u32)>, cooldown: Duration) -> Self {
        let mut seen = HashSet::new();
        let mut endpoints: Vec<EndpointState> = candidates
            .into_iter()
            .filter(|(url, _)| seen.insert(url.clone()))
            .map(|(url, priority)| EndpointState {
                url,
                priority,
                suspected_since: None,
                consecutive_failures: 0,
                total_failures: 0,
                total_successes: 0,
            })
            .collect();
        endpoints.sort_by_key(|e| e.priority);

        Self {
            endpoints: Mutex::new(endpoints),
            cooldown,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }

    /// 选择下一个候选端点
    ///
    /// 依次尝试：
    /// 1. 未被排除且健康的最高优先级端点
    /// 2. 未被排除的最高优先级端点（忽略健康标记）
    /// 3. 最高优先级端点
    ///
    /// 只有注册表为空时返回 None
    pub fn next_candidate(&self, excluding: &HashSet<String>) -> Option<String> {
        let now = Instant::now();
        let mut endpoints = self.endpoints.lock();

        // 冷却期已过的标记顺便清掉
        for ep in endpoints.iter_mut() {
            if ep.suspected_since.is_some() && !ep.is_suspected(now, self.cooldown) {
                ep.suspected_since = None;
                ep.consecutive_failures = 0;
                info!("🔄 端点冷却结束，恢复可用: {}", ep.url);
            }
        }

        // min_by_key 在并列时取第一个，即优先级最高者
        endpoints
            .iter()
            .filter(|ep| !excluding.contains(&ep.url))
            .min_by_key(|ep| ep.suspected_since.is_some())
            .or_else(|| endpoints.first())
            .map(|ep| ep.url.clone())
    }

    /// 连接级失败后标记为疑似故障
    pub fn mark_suspected_down(&self, url: &str) {
        let mut endpoints = self.endpoints.lock();
        if let Some(ep) = endpoints.iter_mut().find(|ep| ep.url == url) {
            ep.consecutive_failures += 1;
            ep.total_failures += 1;
            if ep.suspected_since.is_none() {
                warn!(
                    "✗ 端点标记为疑似故障: {} (冷却 {}s)",
                    url,
                    self.cooldown.as_secs()
                );
            }
            ep.suspected_since = Some(Instant::now());
        }
    }

    /// 成功后立即清除疑似故障标记
    pub fn mark_success(&self, url: &str) {
        let mut endpoints = self.endpoints.lock();
        if let Some(ep) = endpoints.iter_mut().find(|ep| ep.url == url) {
            if ep.suspected_since.take().is_some() {
                info!("✓ 端点恢复: {}", url);
            }
            ep.consecutive_failures = 0;
            ep.total_successes += 1;
        }
    }

    pub fn is_suspected_down(&self, url: &str) -> bool {
        let now = Instant::now();
        self.endpoints
            .lock()
            .iter()
            .find(|ep| ep.url == url)
            .is_some_and(|ep| ep.is_suspected(now, self.cooldown))
    }

    pub fn snapshot(&self) -> Vec<EndpointStatus> {
        let now = Instant::now();
        self.endpoints
            .lock()
            .iter()
            .map(|ep| {
                let suspected = ep.is_suspected(now, self.cooldown);
                let remaining = ep
                    .suspected_since
                    .filter(|_| suspected)
                    .map(|since| self.cooldown.saturating_sub(now.duration_since(since)).as_secs());
                EndpointStatus {
                    url: ep.url.clone(),
                    priority: ep.priority,
                    suspected_down: suspected,
                    cooldown_remaining_secs: remaining,
                    consecutive_failures: ep.consecutive_failures,
                    total_failures: ep.total_failures,
                    total_successes: ep.total_successes,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn registry() -> EndpointRegistry {
        EndpointRegistry::new(vec![
            ("https://c".to_string(), 2),
            ("https://a".to_string(), 0),
            ("https://b".to_string(), 1),
        ])
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_priority_order() {
        let reg = registry();
        assert_eq!(reg.next_candidate(&HashSet::new()).as_deref(), Some("https://a"));
        assert_eq!(reg.next_candidate(&set(&["https://a"])).as_deref(), Some("https://b"));
        assert_eq!(
            reg.next_candidate(&set(&["https://a", "https://b"])).as_deref(),
            Some("https://c")
        );
    }

    #[test]
    fn test_skips_suspected_down() {
        let reg = registry();
        reg.mark_suspected_down("https://a");
        assert!(reg.is_suspected_down("https://a"));
        assert_eq!(reg.next_candidate(&HashSet::new()).as_deref(), Some("https://b"));

        reg.mark_success("https://a");
        assert!(!reg.is_suspected_down("https://a"));
        assert_eq!(reg.next_candidate(&HashSet::new()).as_deref(), Some("https://a"));
    }

    #[test]
    fn test_fallback_when_all_down() {
        let reg = registry();
        for url in ["https://a", "https://b", "https://c"] {
            reg.mark_suspected_down(url);
        }
        // 全部疑似故障时忽略健康标记，但仍尊重排除集合
        assert_eq!(reg.next_candidate(&HashSet::new()).as_deref(), Some("https://a"));
        assert_eq!(reg.next_candidate(&set(&["https://a"])).as_deref(), Some("https://b"));
    }

    #[test]
    fn test_fallback_when_all_excluded() {
        let reg = registry();
        let all = set(&["https://a", "https://b", "https://c"]);
        assert_eq!(reg.next_candidate(&all).as_deref(), Some("https://a"));
        assert_eq!(EndpointRegistry::new(vec![]).next_candidate(&all), None);
    }

    #[test]
    fn test_cooldown_expiry() {
        let reg = EndpointRegistry::with_cooldown(
            vec![("https://a".to_string(), 0), ("https://b".to_string(), 1)],
            Duration::from_millis(30),
        );
        reg.mark_suspected_down("https://a");
        assert_eq!(reg.next_candidate(&HashSet::new()).as_deref(), Some("https://b"));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(reg.next_candidate(&HashSet::new()).as_deref(), Some("https://a"));
        assert!(!reg.snapshot()[0].suspected_down);
    }

    #[test]
    fn test_snapshot_counts() {
        let reg = registry();
        reg.mark_suspected_down("https://b");
        reg.mark_suspected_down("https://b");
        reg.mark_success("https://a");

        let snap = reg.snapshot();
        assert_eq!(snap[0].url, "https://a");
        assert_eq!(snap[0].total_successes, 1);
        assert!(snap[1].suspected_down);
        assert_eq!(snap[1].consecutive_failures, 2);
        assert!(snap[1].cooldown_remaining_secs.is_some());
    }

    proptest! {
        #[test]
        fn never_returns_excluded_unless_forced(
            down in proptest::collection::vec(any::<bool>(), 4),
            excluded in proptest::collection::vec(any::<bool>(), 4),
        ) {
            let urls: Vec<String> = (0..4).map(|i| format!("https://e{}", i)).collect();
            let reg = EndpointRegistry::new(
                urls.iter().cloned().enumerate().map(|(i, u)| (u, i as u32)).collect(),
            );
            for (url, d) in urls.iter().zip(&down) {
                if *d {
                    reg.mark_suspected_down(url);
                }
            }
            let excluding: HashSet<String> = urls
                .iter()
                .zip(&excluded)
                .filter(|(_, e)| **e)
                .map(|(u, _)| u.clone())
                .collect();

            let picked = reg.next_candidate(&excluding).unwrap();
            let healthy_available = urls
                .iter()
                .zip(&down)
                .any(|(u, d)| !*d && !excluding.contains(u));

            if healthy_available {
                prop_assert!(!excluding.contains(&picked));
                prop_assert!(!reg.is_suspected_down(&picked));
            }
            if excluding.len() < urls.len() {
                prop_assert!(!excluding.contains(&picked));
            }
        }
    }
}
