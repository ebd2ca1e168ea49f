//! Built-in enrichers.

use async_trait::async_trait;

use crate::context::ContextStore;
use crate::envelope::{Envelope, Value};
use crate::pipeline::Enricher;

/// Copies the calling task's ambient context into the envelope's
/// `context` map; call-site fields win collisions, resolved left to
/// right.
pub struct AmbientContextEnricher;

#[async_trait]
impl Enricher for AmbientContextEnricher {
    fn name(&self) -> &str {
        "ambient_context"
    }

    async fn enrich(&self, envelope: &mut Envelope) {
        let snapshot = ContextStore::get_ambient();
        for (k, v) in snapshot.into_map() {
            envelope.context.entry(k).or_insert(v);
        }
    }
}

/// Stamps process-wide runtime metadata: pid and, where available, the
/// current thread's name.
pub struct RuntimeInfoEnricher {
    pid: u32,
}

impl Default for RuntimeInfoEnricher {
    fn default() -> Self {
        Self { pid: std::process::id() }
    }
}

#[async_trait]
impl Enricher for RuntimeInfoEnricher {
    fn name(&self) -> &str {
        "runtime_info"
    }

    async fn enrich(&self, envelope: &mut Envelope) {
        envelope
            .data
            .entry("pid".to_string())
            .or_insert(Value::Int(self.pid as i64));
        if let Some(name) = std::thread::current().name() {
            envelope
                .data
                .entry("thread".to_string())
                .or_insert(Value::Str(name.to_string()));
        }
    }
}

/// Stamps static host metadata (hostname), resolved once at construction.
pub struct HostMetadataEnricher {
    hostname: String,
}

impl HostMetadataEnricher {
    pub fn new() -> Self {
        let hostname = hostname_or_unknown();
        Self { hostname }
    }
}

impl Default for HostMetadataEnricher {
    fn default() -> Self {
        Self::new()
    }
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[async_trait]
impl Enricher for HostMetadataEnricher {
    fn name(&self) -> &str {
        "host_metadata"
    }

    async fn enrich(&self, envelope: &mut Envelope) {
        envelope
            .data
            .entry("host".to_string())
            .or_insert(Value::Str(self.hostname.clone()));
    }
}
