use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static RECONCILE_PASSES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "fleet_reconcile_passes_total",
        "completed roster reconciliation passes",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ROSTER_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "fleet_roster_size",
        "instances currently tracked, core included",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static BOOTSTRAP_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_bootstrap_outcomes_total",
            "permission bootstrap runs by resulting phase",
        ),
        &["phase"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CONSOLE_ENTRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_console_entries_total",
            "console entries seen by outcome",
        ),
        &["instance", "outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static OUTBOUND_BATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_outbound_batches_total",
            "outbound items queued for the consumer by channel",
        ),
        &["instance", "channel"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static OUTBOUND_EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_outbound_evictions_total",
            "queued items dropped unread because the consumer fell behind",
        ),
        &["instance", "channel"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static POLL_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_poll_failures_total",
            "console poll cycles that did not yield entries by kind",
        ),
        &["instance", "kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
