use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::config::ServerConfig;
use crate::prompts::{PromptSource, StaticPrompts};
use crate::registry::RoomRegistry;
use crate::transition::{TracingTransitionSink, TransitionSink};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub config: Arc<ServerConfig>,
    pub ws_connection_count: Arc<AtomicUsize>,
    next_conn_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let prompts: Arc<dyn PromptSource> =
            Arc::new(StaticPrompts::new(config.prompts.pool.clone()));
        Self::with_hooks(config, prompts, Arc::new(TracingTransitionSink))
    }

    /// Build state with a custom prompt source and transition sink.
    pub fn with_hooks(
        config: ServerConfig,
        prompts: Arc<dyn PromptSource>,
        sink: Arc<dyn TransitionSink>,
    ) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new(&config, prompts, sink)),
            config: Arc::new(config),
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn alloc_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// One slot in the WebSocket connection budget, released on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    /// Take a slot unless `max` are already in use.
    pub fn try_acquire(counter: Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self { counter })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
