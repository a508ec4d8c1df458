use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use qgate_common::{QuotaConfig, QuotaLimits};
use qgate_storage::{
    AuditDelta, AuditRow, CounterBatch, GlobalDelta, Storage, UsageDelta,
};

use crate::clock;

const SNAPSHOT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageKind {
    Chat,
    Search,
}

impl UsageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageKind::Chat => "chat",
            UsageKind::Search => "search",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitReason {
    Daily,
    Rpm,
}

impl LimitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitReason::Daily => "daily",
            LimitReason::Rpm => "rpm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Limited(LimitReason),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GaugeSnapshot {
    pub used: i64,
    pub limit: u32,
    pub percent: u32,
}

impl GaugeSnapshot {
    fn new(used: i64, limit: u32) -> Self {
        let percent = if limit > 0 {
            ((used.max(0) as u64 * 100) / limit as u64).min(100) as u32
        } else {
            0
        };
        Self {
            used,
            limit,
            percent,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KindUsage {
    pub daily: GaugeSnapshot,
    pub rpm: GaugeSnapshot,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AccountUsage {
    pub chat: KindUsage,
    pub search: KindUsage,
}

#[derive(Debug, Clone)]
struct RpmWindow {
    minute: String,
    count: i64,
}

#[derive(Debug, Clone)]
struct CachedUsage {
    date: String,
    at: Instant,
    by_kind: HashMap<&'static str, i64>,
}

#[derive(Default)]
struct PendingWrites {
    usage: HashMap<(String, String, &'static str), i64>,
    audit: HashMap<(String, String, &'static str, String), i64>,
    global: HashMap<String, i64>,
}

impl PendingWrites {
    fn is_empty(&self) -> bool {
        self.usage.is_empty() && self.audit.is_empty() && self.global.is_empty()
    }

    fn drain_into_batch(&mut self) -> CounterBatch {
        let usage = std::mem::take(&mut self.usage)
            .into_iter()
            .map(|((date, provider_id, kind), delta)| UsageDelta {
                date,
                provider_id,
                kind: kind.to_string(),
                delta,
            })
            .collect();
        let audit = std::mem::take(&mut self.audit)
            .into_iter()
            .map(|((minute_bucket, provider_id, kind, outcome), delta)| AuditDelta {
                minute_bucket,
                provider_id,
                kind: kind.to_string(),
                outcome,
                delta,
            })
            .collect();
        let global = std::mem::take(&mut self.global)
            .into_iter()
            .map(|(key, delta)| GlobalDelta { key, delta })
            .collect();
        CounterBatch {
            usage,
            audit,
            global,
        }
    }
}

struct QuotaInner {
    rpm: HashMap<(String, UsageKind), RpmWindow>,
    usage_cache: HashMap<String, CachedUsage>,
    pending: PendingWrites,
}

/// Per-process admission control and buffered counter writes.
///
/// Writes are summed by key into three pending maps and flushed as one
/// batched upsert transaction through a single mpsc-serviced worker, so
/// concurrent writers observe FIFO durability of their batch without a mutex
/// on the issuing path. Batches are best-effort: a failed flush is logged,
/// never retried.
pub struct QuotaManager {
    storage: Option<Arc<dyn Storage>>,
    config: QuotaConfig,
    success_audit: bool,
    inner: Mutex<QuotaInner>,
    flush_tx: mpsc::UnboundedSender<CounterBatch>,
}

impl QuotaManager {
    pub fn new(
        storage: Option<Arc<dyn Storage>>,
        config: QuotaConfig,
        success_audit: bool,
    ) -> Arc<Self> {
        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel::<CounterBatch>();
        let flush_storage = storage.clone();
        tokio::spawn(async move {
            while let Some(batch) = flush_rx.recv().await {
                let Some(storage) = flush_storage.as_ref() else {
                    continue;
                };
                if let Err(err) = storage.apply_counter_batch(&batch).await {
                    warn!(event = "counter_flush_failed", error = %err);
                }
            }
        });

        Arc::new(Self {
            storage,
            config,
            success_audit,
            inner: Mutex::new(QuotaInner {
                rpm: HashMap::new(),
                usage_cache: HashMap::new(),
                pending: PendingWrites::default(),
            }),
            flush_tx,
        })
    }

    fn limits(&self, kind: UsageKind) -> QuotaLimits {
        match kind {
            UsageKind::Chat => self.config.chat,
            UsageKind::Search => self.config.search,
        }
    }

    /// Pre-flight admission. A rejection records its own `limited:*` audit
    /// row (and bumps the RPM window), so repeated blocked attempts converge
    /// upward and keep the account skipped on the next rotation.
    pub async fn check(&self, provider_id: &str, kind: UsageKind) -> Admission {
        let limits = self.limits(kind);

        if limits.daily > 0 {
            let used = self.daily_used(provider_id, kind).await;
            if used >= limits.daily as i64 {
                self.record_limit_hit(provider_id, kind, LimitReason::Daily);
                return Admission::Limited(LimitReason::Daily);
            }
        }

        if limits.rpm > 0 {
            let minute = clock::beijing_minute(clock::now_unix_ms());
            let count = {
                let inner = self.lock();
                inner
                    .rpm
                    .get(&(provider_id.to_string(), kind))
                    .filter(|w| w.minute == minute)
                    .map(|w| w.count)
                    .unwrap_or(0)
            };
            if count >= limits.rpm as i64 {
                self.record_limit_hit(provider_id, kind, LimitReason::Rpm);
                return Admission::Limited(LimitReason::Rpm);
            }
        }

        Admission::Allowed
    }

    /// Admission rejection bookkeeping. Does not touch the daily usage
    /// partition: rejected dispatches are not accepted requests.
    pub fn record_limit_hit(&self, provider_id: &str, kind: UsageKind, reason: LimitReason) {
        let now = clock::now_unix_ms();
        let minute = clock::beijing_minute(now);
        let batch = {
            let mut inner = self.lock();
            bump_rpm(&mut inner, provider_id, kind, &minute);
            *inner
                .pending
                .audit
                .entry((
                    minute,
                    provider_id.to_string(),
                    kind.as_str(),
                    format!("limited:{}", reason.as_str()),
                ))
                .or_insert(0) += 1;
            *inner
                .pending
                .global
                .entry(format!("{}_total", kind.as_str()))
                .or_insert(0) += 1;
            *inner
                .pending
                .global
                .entry(format!("{}_rate_limited", kind.as_str()))
                .or_insert(0) += 1;
            inner.pending.drain_into_batch()
        };
        self.dispatch_flush(batch);
    }

    /// Called once per successful upstream response.
    pub fn increment_usage(&self, provider_id: &str, kind: UsageKind) {
        self.record_attempt(provider_id, kind, "success", "success");
    }

    /// Failures consumed an attempt, so they count against RPM and the daily
    /// partition, but are recorded as errors for observability.
    pub fn record_failure(&self, provider_id: &str, kind: UsageKind, reason: &str) {
        let global_suffix = "error";
        self.record_attempt(
            provider_id,
            kind,
            &format!("error:{reason}"),
            global_suffix,
        );
    }

    fn record_attempt(
        &self,
        provider_id: &str,
        kind: UsageKind,
        outcome: &str,
        global_suffix: &str,
    ) {
        let now = clock::now_unix_ms();
        let date = clock::beijing_date(now);
        let minute = clock::beijing_minute(now);
        let batch = {
            let mut inner = self.lock();
            bump_rpm(&mut inner, provider_id, kind, &minute);
            *inner
                .pending
                .usage
                .entry((date.clone(), provider_id.to_string(), kind.as_str()))
                .or_insert(0) += 1;
            *inner
                .pending
                .audit
                .entry((
                    minute,
                    provider_id.to_string(),
                    kind.as_str(),
                    outcome.to_string(),
                ))
                .or_insert(0) += 1;
            *inner
                .pending
                .global
                .entry(format!("{}_total", kind.as_str()))
                .or_insert(0) += 1;
            *inner
                .pending
                .global
                .entry(format!("{}_{global_suffix}", kind.as_str()))
                .or_insert(0) += 1;
            merge_cache(&mut inner, provider_id, kind, &date, 1);
            inner.pending.drain_into_batch()
        };
        self.dispatch_flush(batch);
    }

    fn dispatch_flush(&self, batch: CounterBatch) {
        if batch.is_empty() {
            return;
        }
        // Send only fails after the flush worker stopped, i.e. at shutdown.
        let _ = self.flush_tx.send(batch);
    }

    async fn daily_used(&self, provider_id: &str, kind: UsageKind) -> i64 {
        let today = clock::beijing_date(clock::now_unix_ms());
        {
            let inner = self.lock();
            if let Some(cached) = inner.usage_cache.get(provider_id) {
                if cached.date == today {
                    let fresh = self.storage.is_none() || cached.at.elapsed() < SNAPSHOT_TTL;
                    if fresh {
                        return cached.by_kind.get(kind.as_str()).copied().unwrap_or(0);
                    }
                }
            }
        }

        let by_kind = self.fetch_daily(&today, provider_id).await;
        let mut inner = self.lock();
        let entry = CachedUsage {
            date: today,
            at: Instant::now(),
            by_kind,
        };
        let used = entry.by_kind.get(kind.as_str()).copied().unwrap_or(0);
        inner.usage_cache.insert(provider_id.to_string(), entry);
        used
    }

    async fn fetch_daily(&self, date: &str, provider_id: &str) -> HashMap<&'static str, i64> {
        let Some(storage) = self.storage.as_ref() else {
            return HashMap::new();
        };
        match storage.usage_by_kind(date, provider_id).await {
            Ok(rows) => intern_kinds(rows),
            Err(err) => {
                warn!(event = "usage_snapshot_read_failed", provider = %provider_id, error = %err);
                HashMap::new()
            }
        }
    }

    /// Single-account usage readout. Daily comes from the snapshot cache or
    /// the store; RPM is read from the current minute bucket of the audit
    /// store, which is authoritative across instances.
    pub async fn usage_for(&self, provider_id: &str) -> AccountUsage {
        let now = clock::now_unix_ms();
        let minute = clock::beijing_minute(now);

        let mut rpm_by_kind: HashMap<String, i64> = HashMap::new();
        if let Some(storage) = self.storage.as_ref() {
            match storage.minute_attempts(&minute, provider_id).await {
                Ok(rows) => rpm_by_kind = rows,
                Err(err) => {
                    warn!(event = "rpm_snapshot_read_failed", provider = %provider_id, error = %err);
                }
            }
        } else {
            let inner = self.lock();
            for kind in [UsageKind::Chat, UsageKind::Search] {
                let count = inner
                    .rpm
                    .get(&(provider_id.to_string(), kind))
                    .filter(|w| w.minute == minute)
                    .map(|w| w.count)
                    .unwrap_or(0);
                rpm_by_kind.insert(kind.as_str().to_string(), count);
            }
        }

        let chat_daily = self.daily_used(provider_id, UsageKind::Chat).await;
        let search_daily = self.daily_used(provider_id, UsageKind::Search).await;

        AccountUsage {
            chat: KindUsage {
                daily: GaugeSnapshot::new(chat_daily, self.config.chat.daily),
                rpm: GaugeSnapshot::new(
                    rpm_by_kind.get("chat").copied().unwrap_or(0),
                    self.config.chat.rpm,
                ),
            },
            search: KindUsage {
                daily: GaugeSnapshot::new(search_daily, self.config.search.daily),
                rpm: GaugeSnapshot::new(
                    rpm_by_kind.get("search").copied().unwrap_or(0),
                    self.config.search.rpm,
                ),
            },
        }
    }

    /// Aggregate readout using two grouped queries; unknown ids come back
    /// zero-filled.
    pub async fn usage_batch(&self, provider_ids: &[String]) -> HashMap<String, AccountUsage> {
        let now = clock::now_unix_ms();
        let date = clock::beijing_date(now);
        let minute = clock::beijing_minute(now);

        let (daily, rpm) = match self.storage.as_ref() {
            Some(storage) => {
                let daily = storage
                    .usage_by_kind_batch(&date, provider_ids)
                    .await
                    .unwrap_or_else(|err| {
                        warn!(event = "usage_batch_read_failed", error = %err);
                        HashMap::new()
                    });
                let rpm = storage
                    .minute_attempts_batch(&minute, provider_ids)
                    .await
                    .unwrap_or_else(|err| {
                        warn!(event = "rpm_batch_read_failed", error = %err);
                        HashMap::new()
                    });
                (daily, rpm)
            }
            None => (HashMap::new(), HashMap::new()),
        };

        let mut out = HashMap::new();
        for id in provider_ids {
            let lookup = |map: &HashMap<(String, String), i64>, kind: &str| {
                map.get(&(id.clone(), kind.to_string())).copied().unwrap_or(0)
            };
            out.insert(
                id.clone(),
                AccountUsage {
                    chat: KindUsage {
                        daily: GaugeSnapshot::new(
                            lookup(&daily, "chat"),
                            self.config.chat.daily,
                        ),
                        rpm: GaugeSnapshot::new(lookup(&rpm, "chat"), self.config.chat.rpm),
                    },
                    search: KindUsage {
                        daily: GaugeSnapshot::new(
                            lookup(&daily, "search"),
                            self.config.search.daily,
                        ),
                        rpm: GaugeSnapshot::new(lookup(&rpm, "search"), self.config.search.rpm),
                    },
                },
            );
        }
        out
    }

    pub async fn recent_audit(&self, limit: u64) -> Vec<AuditRow> {
        let Some(storage) = self.storage.as_ref() else {
            return Vec::new();
        };
        storage
            .recent_audit(limit, self.success_audit)
            .await
            .unwrap_or_else(|err| {
                warn!(event = "recent_audit_read_failed", error = %err);
                Vec::new()
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QuotaInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn bump_rpm(inner: &mut QuotaInner, provider_id: &str, kind: UsageKind, minute: &str) {
    let window = inner
        .rpm
        .entry((provider_id.to_string(), kind))
        .or_insert_with(|| RpmWindow {
            minute: minute.to_string(),
            count: 0,
        });
    if window.minute != minute {
        window.minute = minute.to_string();
        window.count = 0;
    }
    window.count += 1;
}

fn merge_cache(
    inner: &mut QuotaInner,
    provider_id: &str,
    kind: UsageKind,
    date: &str,
    delta: i64,
) {
    let entry = inner
        .usage_cache
        .entry(provider_id.to_string())
        .or_insert_with(|| CachedUsage {
            date: date.to_string(),
            at: Instant::now(),
            by_kind: HashMap::new(),
        });
    if entry.date != date {
        entry.date = date.to_string();
        entry.at = Instant::now();
        entry.by_kind.clear();
    }
    *entry.by_kind.entry(kind.as_str()).or_insert(0) += delta;
}

fn intern_kinds(rows: HashMap<String, i64>) -> HashMap<&'static str, i64> {
    let mut out = HashMap::new();
    for (kind, count) in rows {
        match kind.as_str() {
            "chat" => {
                out.insert("chat", count);
            }
            "search" => {
                out.insert("search", count);
            }
            _ => {}
        }
    }
    out
}
