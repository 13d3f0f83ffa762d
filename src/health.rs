//! Process-wide component health registry.
//!
//! Long-running components (gateway, dispatch loop, housekeeping) report
//! liveness here; the gateway serves the snapshot at `/health`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub updated_at: DateTime<Utc>,
    pub last_ok: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub restart_count: u64,
}

impl ComponentHealth {
    fn new() -> Self {
        Self {
            status: "starting",
            updated_at: Utc::now(),
            last_ok: None,
            last_error: None,
            restart_count: 0,
        }
    }
}

fn registry() -> &'static Mutex<BTreeMap<String, ComponentHealth>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<String, ComponentHealth>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

fn process_started_at() -> DateTime<Utc> {
    static STARTED: OnceLock<DateTime<Utc>> = OnceLock::new();
    *STARTED.get_or_init(Utc::now)
}

pub fn mark_component_ok(component: &str) {
    let now = Utc::now();
    let mut guard = registry().lock();
    let entry = guard
        .entry(component.to_string())
        .or_insert_with(ComponentHealth::new);
    entry.status = "ok";
    entry.updated_at = now;
    entry.last_ok = Some(now);
}

pub fn mark_component_error(component: &str, error: impl Into<String>) {
    let mut guard = registry().lock();
    let entry = guard
        .entry(component.to_string())
        .or_insert_with(ComponentHealth::new);
    entry.status = "error";
    entry.updated_at = Utc::now();
    entry.last_error = Some(error.into());
}

pub fn bump_component_restart(component: &str) {
    let mut guard = registry().lock();
    let entry = guard
        .entry(component.to_string())
        .or_insert_with(ComponentHealth::new);
    entry.restart_count += 1;
    entry.updated_at = Utc::now();
}

pub fn component(component: &str) -> Option<ComponentHealth> {
    registry().lock().get(component).cloned()
}

pub fn snapshot_json() -> serde_json::Value {
    let started_at = process_started_at();
    let components = registry().lock().clone();
    serde_json::json!({
        "pid": std::process::id(),
        "started_at": started_at.to_rfc3339(),
        "uptime_seconds": (Utc::now() - started_at).num_seconds().max(0),
        "components": components,
    })
}
