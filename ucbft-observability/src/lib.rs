//! Observability capability (SPEC_FULL.md §1 "Ambient stack").
//!
//! All singletons (metrics registry) are injected via this crate rather
//! than reached for as globals from business logic, matching Design Notes
//! §9 "Global state: none." `tracing` macros are used directly at call
//! sites (no wrapper needed, `tracing` already is the injected facade).

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};

pub static CURRENT_ROUND: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ucbft_current_round",
        "Current round of a shard node or root consensus manager",
        &["node", "component"]
    )
    .unwrap()
});

pub static LUC_ROUND: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ucbft_luc_round",
        "Round of the latest unicity certificate seen by a shard node",
        &["node"]
    )
    .unwrap()
});

pub static COMMITTED_ROUND: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ucbft_committed_round",
        "Last committed round",
        &["node", "component"]
    )
    .unwrap()
});

pub static TIMEOUT_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ucbft_timeout_total",
        "Local timeouts observed",
        &["node", "component"]
    )
    .unwrap()
});

pub static REVERT_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ucbft_revert_total",
        "Tx-system reverts triggered by a repeat UC",
        &["node"]
    )
    .unwrap()
});

pub static EQUIVOCATION_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ucbft_equivocation_total",
        "Equivocating UCs/proposals rejected",
        &["node"]
    )
    .unwrap()
});

pub static COMMIT_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ucbft_commit_total",
        "Blocks/rounds committed",
        &["node", "component"]
    )
    .unwrap()
});
