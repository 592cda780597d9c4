//! C5 — per-provider daily/monthly spend and token ledger (§4.5), grounded
//! on the reference `AIQuotaService` / `QuotaCache`: reset semantics, the
//! strict-vs-pause-on-exceed split, cost calculation with legacy pricing
//! fallback, auto-disable, and throttled webhook alerts.

use chrono::{DateTime, Datelike, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use subtitler_common::{QuotaWindow, Result, SubtitlerError};

/// (provider_name, display_name, enabled, ...) per §3; fields not consulted
/// by the ledger (api_key, base_url, timeout, description) live with the
/// provider client, not here.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider_name: String,
    pub display_name: String,
    pub enabled: bool,
    pub default_model: Option<String>,
    pub priority: i32,
}

/// Per-`(provider_name, model_name)` pricing and limits (§3).
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub provider_name: String,
    pub model_name: String,
    pub is_default: bool,
    pub input_price_per_m: Option<f64>,
    pub output_price_per_m: Option<f64>,
}

/// Legacy per-1k pricing fallback for providers/models with no `ModelConfig`
/// pricing row, mirroring the reference `ModelRegistry` fallback table.
#[derive(Debug, Clone, Copy)]
pub struct LegacyPricing {
    pub input_per_k: f64,
    pub output_per_k: f64,
}

#[derive(Debug, Clone)]
pub struct Quota {
    pub provider_name: String,
    pub daily_limit: f64,
    pub monthly_limit: f64,
    pub daily_token_limit: Option<u64>,
    pub monthly_token_limit: Option<u64>,
    pub current_daily_cost: f64,
    pub current_monthly_cost: f64,
    pub current_daily_tokens: u64,
    pub current_monthly_tokens: u64,
    pub daily_reset_at: DateTime<Utc>,
    pub monthly_reset_at: DateTime<Utc>,
    pub alert_threshold_percent: f64,
    pub auto_disable_on_limit: bool,
    pub last_alert_sent_at: Option<DateTime<Utc>>,
}

impl Quota {
    pub fn new(provider_name: impl Into<String>, daily_limit: f64, monthly_limit: f64, now: DateTime<Utc>) -> Self {
        Self {
            provider_name: provider_name.into(),
            daily_limit,
            monthly_limit,
            daily_token_limit: None,
            monthly_token_limit: None,
            current_daily_cost: 0.0,
            current_monthly_cost: 0.0,
            current_daily_tokens: 0,
            current_monthly_tokens: 0,
            daily_reset_at: now,
            monthly_reset_at: now,
            alert_threshold_percent: 80.0,
            auto_disable_on_limit: true,
            last_alert_sent_at: None,
        }
    }

    /// Daily resets on elapsed wall-clock days; monthly resets on a genuine
    /// calendar-month rollover (§4.5 reset semantics), not a fixed interval.
    fn reset_if_needed(&mut self, now: DateTime<Utc>) {
        if (now - self.daily_reset_at).num_days() >= 1 {
            self.current_daily_cost = 0.0;
            self.current_daily_tokens = 0;
            self.daily_reset_at = now;
        }
        if now.year() != self.monthly_reset_at.year() || now.month() != self.monthly_reset_at.month() {
            self.current_monthly_cost = 0.0;
            self.current_monthly_tokens = 0;
            self.monthly_reset_at = now;
        }
    }

    fn next_daily_boundary(&self) -> DateTime<Utc> {
        self.daily_reset_at + chrono::Duration::days(1)
    }

    fn next_monthly_boundary(&self) -> DateTime<Utc> {
        let year = self.monthly_reset_at.year();
        let month = self.monthly_reset_at.month();
        let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
        chrono::Utc
            .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
            .single()
            .unwrap_or(self.monthly_reset_at + chrono::Duration::days(30))
    }

    fn percent_used(&self) -> (f64, f64) {
        let daily_pct = if self.daily_limit > 0.0 {
            (self.current_daily_cost / self.daily_limit) * 100.0
        } else {
            0.0
        };
        let monthly_pct = if self.monthly_limit > 0.0 {
            (self.current_monthly_cost / self.monthly_limit) * 100.0
        } else {
            0.0
        };
        (daily_pct, monthly_pct)
    }

    /// Which window (if any) a request of `added_cost`/`added_tokens` would
    /// breach, checked *before* committing the usage.
    fn breach(&self, added_cost: f64, added_tokens: u64) -> Option<QuotaWindow> {
        if self.daily_limit > 0.0 && self.current_daily_cost + added_cost >= self.daily_limit {
            return Some(QuotaWindow::Daily);
        }
        if let Some(limit) = self.daily_token_limit
            && self.current_daily_tokens + added_tokens >= limit {
                return Some(QuotaWindow::Daily);
            }
        if self.monthly_limit > 0.0 && self.current_monthly_cost + added_cost >= self.monthly_limit {
            return Some(QuotaWindow::Monthly);
        }
        if let Some(limit) = self.monthly_token_limit
            && self.current_monthly_tokens + added_tokens >= limit {
                return Some(QuotaWindow::Monthly);
            }
        None
    }
}

/// One append-only row per generation call (§3 UsageLog).
#[derive(Debug, Clone)]
pub struct UsageLogRow {
    pub provider: String,
    pub model: String,
    pub job_id: Option<uuid::Uuid>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub is_error: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// A cached pause outcome carries the window and resume boundary a cache hit
/// must reconstruct `SubtitlerError::QuotaPause` from (§4.5 Quota cache).
#[derive(Debug, Clone, Copy)]
pub struct CachedPause {
    pub window: QuotaWindow,
    pub resume_at: DateTime<Utc>,
}

struct CacheEntry {
    can_proceed: bool,
    pending_pause: Option<CachedPause>,
    inserted_at: std::time::Instant,
}

/// Bounded cache avoiding hot-loop reads during per-segment checks (§4.5
/// Quota cache). Evicts the oldest entry past `max_size`; entries older
/// than `ttl` are treated as expired on lookup.
pub struct QuotaCache {
    max_size: usize,
    ttl: Duration,
    order: Vec<String>,
    entries: HashMap<String, CacheEntry>,
    stats: QuotaCacheStats,
}

impl QuotaCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size,
            ttl,
            order: Vec::new(),
            entries: HashMap::new(),
            stats: QuotaCacheStats::default(),
        }
    }

    pub fn get(&mut self, provider: &str) -> Option<(bool, Option<CachedPause>)> {
        let expired = self
            .entries
            .get(provider)
            .map(|e| e.inserted_at.elapsed() >= self.ttl)
            .unwrap_or(false);

        if expired {
            self.entries.remove(provider);
            self.order.retain(|p| p != provider);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }

        match self.entries.get(provider) {
            Some(entry) => {
                self.stats.hits += 1;
                Some((entry.can_proceed, entry.pending_pause))
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn set(&mut self, provider: &str, can_proceed: bool, pending_pause: Option<CachedPause>) {
        if !self.entries.contains_key(provider) && self.entries.len() >= self.max_size
            && let Some(oldest) = self.order.first().cloned() {
                self.entries.remove(&oldest);
                self.order.remove(0);
                self.stats.evictions += 1;
            }
        if !self.entries.contains_key(provider) {
            self.order.push(provider.to_string());
        }
        self.entries.insert(
            provider.to_string(),
            CacheEntry {
                can_proceed,
                pending_pause,
                inserted_at: std::time::Instant::now(),
            },
        );
    }

    pub fn stats(&self) -> QuotaCacheStats {
        self.stats
    }
}

/// Alert payload posted to a provider's configured webhook (§4.5 Alerts).
#[derive(Debug, Clone)]
pub struct QuotaAlert {
    pub provider: String,
    pub daily_percent: f64,
    pub monthly_percent: f64,
    pub timestamp: DateTime<Utc>,
}

struct Inner {
    providers: HashMap<String, ProviderConfig>,
    models: HashMap<(String, String), ModelConfig>,
    quotas: HashMap<String, Quota>,
    usage_log: Vec<UsageLogRow>,
    cache: QuotaCache,
}

/// The Quota & Usage Ledger (C5).
pub struct QuotaLedger {
    inner: RwLock<Inner>,
    legacy_pricing: HashMap<String, LegacyPricing>,
}

impl QuotaLedger {
    pub fn new(cache_max_size: usize, cache_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                providers: HashMap::new(),
                models: HashMap::new(),
                quotas: HashMap::new(),
                usage_log: Vec::new(),
                cache: QuotaCache::new(cache_max_size, cache_ttl),
            }),
            legacy_pricing: HashMap::new(),
        }
    }

    pub fn register_provider(&self, config: ProviderConfig, quota: Quota) {
        let mut guard = self.inner.write();
        guard.quotas.insert(config.provider_name.clone(), quota);
        guard.providers.insert(config.provider_name.clone(), config);
    }

    /// `is_default=true` holds at most once per provider (§3): setting a new
    /// default flips the previous one off.
    pub fn register_model(&self, config: ModelConfig) {
        let mut guard = self.inner.write();
        if config.is_default {
            for existing in guard.models.values_mut() {
                if existing.provider_name == config.provider_name {
                    existing.is_default = false;
                }
            }
        }
        guard
            .models
            .insert((config.provider_name.clone(), config.model_name.clone()), config);
    }

    pub fn set_legacy_pricing(&mut self, provider: impl Into<String>, pricing: LegacyPricing) {
        self.legacy_pricing.insert(provider.into(), pricing);
    }

    fn calculate_cost(
        guard: &Inner,
        legacy: &HashMap<String, LegacyPricing>,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> (f64, bool) {
        if let Some(cfg) = guard.models.get(&(provider.to_string(), model.to_string()))
            && let (Some(in_price), Some(out_price)) = (cfg.input_price_per_m, cfg.output_price_per_m) {
                let cost = (input_tokens as f64 * in_price + output_tokens as f64 * out_price) / 1_000_000.0;
                return (cost, false);
            }
        if let Some(pricing) = legacy.get(provider) {
            let cost = (input_tokens as f64 / 1000.0) * pricing.input_per_k
                + (output_tokens as f64 / 1000.0) * pricing.output_per_k;
            return (cost, false);
        }
        (0.0, true)
    }

    /// Strict check (§4.5 mode 1): used at job dispatch. Fails outright and,
    /// if configured, auto-disables the provider (§8 scenario 5).
    pub fn check_strict(&self, provider: &str, now: DateTime<Utc>) -> Result<()> {
        let mut guard = self.inner.write();
        let quota = guard
            .quotas
            .get_mut(provider)
            .ok_or_else(|| SubtitlerError::NotFound(format!("quota for provider {provider}")))?;
        quota.reset_if_needed(now);

        let window = quota.breach(0.0, 0);
        if window.is_none() {
            return Ok(());
        }
        let window = window.unwrap();
        let (current, limit) = match window {
            QuotaWindow::Daily => (quota.current_daily_cost, quota.daily_limit),
            QuotaWindow::Monthly => (quota.current_monthly_cost, quota.monthly_limit),
        };
        let auto_disable = quota.auto_disable_on_limit;

        if auto_disable
            && let Some(cfg) = guard.providers.get_mut(provider) {
                cfg.enabled = false;
            }

        Err(SubtitlerError::QuotaExceeded {
            provider: provider.to_string(),
            window,
            current,
            limit,
        })
    }

    /// Pause-on-exceed check (§4.5 mode 2): used inside translation loops.
    /// Fail-open on the underlying cache miss turning into an internal
    /// error — never hang the batch because the ledger briefly errored.
    pub fn check_pause_on_exceed(&self, provider: &str, now: DateTime<Utc>) -> Result<()> {
        {
            let mut guard = self.inner.write();
            if let Some((can_proceed, pending_pause)) = guard.cache.get(provider) {
                if can_proceed {
                    return Ok(());
                }
                let pause = pending_pause.unwrap_or(CachedPause {
                    window: QuotaWindow::Daily,
                    resume_at: now,
                });
                return Err(SubtitlerError::QuotaPause {
                    provider: provider.to_string(),
                    window: pause.window,
                    resume_at: pause.resume_at.into(),
                });
            }
        }

        let outcome = self.evaluate_pause(provider, now);
        let mut guard = self.inner.write();
        match &outcome {
            Ok(()) => guard.cache.set(provider, true, None),
            Err(SubtitlerError::QuotaPause { window, resume_at, .. }) => guard.cache.set(
                provider,
                false,
                Some(CachedPause {
                    window: *window,
                    resume_at: (*resume_at).into(),
                }),
            ),
            Err(_) => guard.cache.set(provider, true, None),
        }
        outcome
    }

    fn evaluate_pause(&self, provider: &str, now: DateTime<Utc>) -> Result<()> {
        let mut guard = self.inner.write();
        let quota = guard
            .quotas
            .get_mut(provider)
            .ok_or_else(|| SubtitlerError::NotFound(format!("quota for provider {provider}")))?;
        quota.reset_if_needed(now);

        match quota.breach(0.0, 0) {
            None => Ok(()),
            Some(window) => {
                let resume_at = match window {
                    QuotaWindow::Daily => quota.next_daily_boundary(),
                    QuotaWindow::Monthly => quota.next_monthly_boundary(),
                };
                Err(SubtitlerError::QuotaPause {
                    provider: provider.to_string(),
                    window,
                    resume_at: resume_at.into(),
                })
            }
        }
    }

    /// Appends a `UsageLog` row and updates counters atomically (§4.5 Usage
    /// logging). Local-host providers skip quota/logging entirely — callers
    /// should not invoke this for them.
    pub fn log_usage(
        &self,
        provider: &str,
        model: &str,
        job_id: Option<uuid::Uuid>,
        input_tokens: u64,
        output_tokens: u64,
        now: DateTime<Utc>,
    ) -> f64 {
        let mut guard = self.inner.write();
        let (cost, missing_pricing) =
            Self::calculate_cost(&guard, &self.legacy_pricing, provider, model, input_tokens, output_tokens);
        if missing_pricing {
            log::warn!("no pricing configured for {provider}:{model}, logging cost as 0.0");
        }

        if let Some(quota) = guard.quotas.get_mut(provider) {
            quota.reset_if_needed(now);
            quota.current_daily_cost += cost;
            quota.current_monthly_cost += cost;
            quota.current_daily_tokens += input_tokens + output_tokens;
            quota.current_monthly_tokens += input_tokens + output_tokens;
        }

        guard.usage_log.push(UsageLogRow {
            provider: provider.to_string(),
            model: model.to_string(),
            job_id,
            input_tokens,
            output_tokens,
            cost,
            is_error: false,
            recorded_at: now,
        });
        cost
    }

    pub fn log_error(&self, provider: &str, model: &str, job_id: Option<uuid::Uuid>, now: DateTime<Utc>) {
        self.inner.write().usage_log.push(UsageLogRow {
            provider: provider.to_string(),
            model: model.to_string(),
            job_id,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            is_error: true,
            recorded_at: now,
        });
    }

    pub fn usage_stats(&self, provider: &str) -> Vec<UsageLogRow> {
        self.inner
            .read()
            .usage_log
            .iter()
            .filter(|r| r.provider == provider)
            .cloned()
            .collect()
    }

    pub fn quota_snapshot(&self, provider: &str) -> Option<Quota> {
        self.inner.read().quotas.get(provider).cloned()
    }

    pub fn provider_enabled(&self, provider: &str) -> Option<bool> {
        self.inner.read().providers.get(provider).map(|p| p.enabled)
    }

    pub fn quota_cache_stats(&self) -> QuotaCacheStats {
        self.inner.read().cache.stats()
    }

    /// Builds an alert if `max(daily%, monthly%) >= alert_threshold_percent`
    /// and the last alert for this provider is older than one hour (§4.5
    /// Alerts); returns `None` when no alert should fire.
    pub fn maybe_alert(&self, provider: &str, now: DateTime<Utc>) -> Option<QuotaAlert> {
        let mut guard = self.inner.write();
        let quota = guard.quotas.get_mut(provider)?;
        let (daily_pct, monthly_pct) = quota.percent_used();
        if daily_pct.max(monthly_pct) < quota.alert_threshold_percent {
            return None;
        }
        if let Some(last) = quota.last_alert_sent_at
            && now - last < chrono::Duration::hours(1) {
                return None;
            }
        quota.last_alert_sent_at = Some(now);
        Some(QuotaAlert {
            provider: provider.to_string(),
            daily_percent: daily_pct,
            monthly_percent: monthly_pct,
            timestamp: now,
        })
    }
}

use chrono::TimeZone;

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(provider: &str, daily_limit: f64, monthly_limit: f64, now: DateTime<Utc>) -> QuotaLedger {
        let ledger = QuotaLedger::new(100, Duration::from_secs(60));
        ledger.register_provider(
            ProviderConfig {
                provider_name: provider.to_string(),
                display_name: provider.to_string(),
                enabled: true,
                default_model: None,
                priority: 0,
            },
            Quota::new(provider, daily_limit, monthly_limit, now),
        );
        ledger
    }

    #[test]
    fn strict_check_passes_under_limit() {
        let now = Utc::now();
        let ledger = ledger_with("openai", 10.0, 100.0, now);
        assert!(ledger.check_strict("openai", now).is_ok());
    }

    #[test]
    fn strict_check_fails_and_auto_disables_at_limit() {
        let now = Utc::now();
        let ledger = ledger_with("deepseek", 10.0, 1.0, now);
        ledger.log_usage("deepseek", "deepseek-chat", None, 1_000_000, 0, now);
        // input price missing -> cost 0.0, so force the breach by hand via monthly limit already at cap
        {
            let mut guard = ledger.inner.write();
            let q = guard.quotas.get_mut("deepseek").unwrap();
            q.current_monthly_cost = 1.0;
        }
        let result = ledger.check_strict("deepseek", now);
        assert!(matches!(result, Err(SubtitlerError::QuotaExceeded { .. })));
        assert_eq!(ledger.provider_enabled("deepseek"), Some(false));
    }

    #[test]
    fn pause_on_exceed_returns_next_daily_boundary() {
        let now = Utc::now();
        let ledger = ledger_with("openai", 0.001, 1000.0, now);
        {
            let mut guard = ledger.inner.write();
            let q = guard.quotas.get_mut("openai").unwrap();
            q.current_daily_cost = 0.001;
        }
        match ledger.check_pause_on_exceed("openai", now) {
            Err(SubtitlerError::QuotaPause {
                window, resume_at, ..
            }) => {
                assert_eq!(window, QuotaWindow::Daily);
                let resume_at: DateTime<Utc> = resume_at.into();
                assert!(resume_at > now);
            }
            other => panic!("expected QuotaPause, got {other:?}"),
        }
    }

    #[test]
    fn cost_uses_model_pricing_per_million_tokens() {
        let now = Utc::now();
        let ledger = ledger_with("openai", 1000.0, 1000.0, now);
        ledger.register_model(ModelConfig {
            provider_name: "openai".into(),
            model_name: "gpt-4o-mini".into(),
            is_default: true,
            input_price_per_m: Some(1.0),
            output_price_per_m: Some(2.0),
        });
        let cost = ledger.log_usage("openai", "gpt-4o-mini", None, 1_000_000, 500_000, now);
        assert!((cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn missing_pricing_logs_zero_cost_without_failing() {
        let now = Utc::now();
        let ledger = ledger_with("openai", 1000.0, 1000.0, now);
        let cost = ledger.log_usage("openai", "unknown-model", None, 100, 100, now);
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn only_one_default_model_per_provider() {
        let now = Utc::now();
        let ledger = ledger_with("openai", 1000.0, 1000.0, now);
        ledger.register_model(ModelConfig {
            provider_name: "openai".into(),
            model_name: "m1".into(),
            is_default: true,
            input_price_per_m: None,
            output_price_per_m: None,
        });
        ledger.register_model(ModelConfig {
            provider_name: "openai".into(),
            model_name: "m2".into(),
            is_default: true,
            input_price_per_m: None,
            output_price_per_m: None,
        });
        let guard = ledger.inner.read();
        let defaults: Vec<_> = guard
            .models
            .values()
            .filter(|m| m.provider_name == "openai" && m.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].model_name, "m2");
    }

    #[test]
    fn cached_pause_hit_reconstructs_quota_pause_with_window() {
        let now = Utc::now();
        let ledger = ledger_with("openai", 0.001, 1000.0, now);
        {
            let mut guard = ledger.inner.write();
            let q = guard.quotas.get_mut("openai").unwrap();
            q.current_daily_cost = 0.001;
        }

        // First call misses the cache and evaluates the breach directly.
        let first = ledger.check_pause_on_exceed("openai", now);
        assert!(matches!(first, Err(SubtitlerError::QuotaPause { .. })));

        // Second call within the TTL window hits the cache; it must still
        // surface a real QuotaPause (not an Internal error) carrying the
        // same window and resume_at, so the engine pauses rather than fails
        // the job.
        match ledger.check_pause_on_exceed("openai", now) {
            Err(SubtitlerError::QuotaPause { window, resume_at, .. }) => {
                assert_eq!(window, QuotaWindow::Daily);
                let resume_at: DateTime<Utc> = resume_at.into();
                assert!(resume_at > now);
            }
            other => panic!("expected cached QuotaPause, got {other:?}"),
        }
        assert_eq!(ledger.quota_cache_stats().hits, 1);
    }

    #[test]
    fn quota_cache_reports_hit_and_miss_counters() {
        let now = Utc::now();
        let ledger = ledger_with("openai", 1000.0, 1000.0, now);
        ledger.check_pause_on_exceed("openai", now).unwrap();
        ledger.check_pause_on_exceed("openai", now).unwrap();
        let stats = ledger.quota_cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn daily_reset_after_elapsed_day() {
        let now = Utc::now();
        let ledger = ledger_with("openai", 10.0, 1000.0, now);
        {
            let mut guard = ledger.inner.write();
            let q = guard.quotas.get_mut("openai").unwrap();
            q.current_daily_cost = 9.0;
        }
        let later = now + chrono::Duration::days(2);
        assert!(ledger.check_strict("openai", later).is_ok());
        let snapshot = ledger.quota_snapshot("openai").unwrap();
        assert_eq!(snapshot.current_daily_cost, 0.0);
    }

    #[test]
    fn alert_fires_above_threshold_then_throttles() {
        let now = Utc::now();
        let ledger = ledger_with("openai", 10.0, 1000.0, now);
        {
            let mut guard = ledger.inner.write();
            let q = guard.quotas.get_mut("openai").unwrap();
            q.current_daily_cost = 9.0;
        }
        assert!(ledger.maybe_alert("openai", now).is_some());
        assert!(ledger.maybe_alert("openai", now + chrono::Duration::minutes(10)).is_none());
        assert!(ledger
            .maybe_alert("openai", now + chrono::Duration::hours(2))
            .is_some());
    }
}
