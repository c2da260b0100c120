//! Single cached block template with tip/mempool invalidation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::MiningResult;
use crate::gateway::{MempoolSnapshot, TemplateBuilder, TipHandle};
use crate::primitives::BlockHash;
use crate::template::BlockTemplate;

pub const DEFAULT_MIN_REBUILD_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct CacheState {
    /// Tip the cached template was built on. Cleared before every rebuild.
    last_tip: Option<BlockHash>,
    last_mempool_version: u64,
    last_build: Option<Instant>,
    cached: Option<Arc<BlockTemplate>>,
}

/// Result of [`TemplateCache::get`].
#[derive(Debug, Clone)]
pub struct CachedTemplate {
    pub template: Arc<BlockTemplate>,
    /// Mempool version recorded by the build that produced `template`.
    pub mempool_version: u64,
    pub rebuilt: bool,
}

pub struct TemplateCache {
    state: Mutex<CacheState>,
    min_rebuild_interval: Duration,
}

impl TemplateCache {
    pub fn new(min_rebuild_interval: Duration) -> Self {
        TemplateCache {
            state: Mutex::new(CacheState::default()),
            min_rebuild_interval,
        }
    }

    /// Returns the cached template, rebuilding first when the tip moved or
    /// the mempool changed and the rebuild interval has passed.
    ///
    /// The lock is held across the build, so concurrent callers never start
    /// a second rebuild; they wait and then see the fresh template.
    pub fn get(
        &self,
        builder: &dyn TemplateBuilder,
        mempool: &MempoolSnapshot,
        tip: &TipHandle,
        payout_script: &[u8],
    ) -> MiningResult<CachedTemplate> {
        let mut state = self.lock();

        let tip_changed = state.last_tip != Some(tip.hash);
        let mempool_stale = mempool.update_counter != state.last_mempool_version
            && state
                .last_build
                .is_none_or(|at| at.elapsed() >= self.min_rebuild_interval);

        if !tip_changed
            && !mempool_stale
            && let Some(template) = state.cached.clone()
        {
            return Ok(CachedTemplate {
                template,
                mempool_version: state.last_mempool_version,
                rebuilt: false,
            });
        }

        state.last_tip = None;
        state.last_mempool_version = mempool.update_counter;
        state.last_build = Some(Instant::now());

        debug!(
            tip = %tip.hash,
            mempool_version = mempool.update_counter,
            tip_changed,
            "rebuilding block template"
        );

        let template = match builder.build(mempool, payout_script) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                warn!(error = %e, "template build failed, cache left cleared");
                state.cached = None;
                return Err(e.into());
            }
        };

        info!(
            height = template.height,
            prev = %template.previous_block_hash(),
            txs = template.transactions.len(),
            mempool_version = mempool.update_counter,
            "new block template"
        );

        state.last_tip = Some(tip.hash);
        state.cached = Some(template.clone());

        Ok(CachedTemplate {
            template,
            mempool_version: mempool.update_counter,
            rebuilt: true,
        })
    }

    /// Mempool version the current template was built against.
    pub fn last_mempool_version(&self) -> u64 {
        self.lock().last_mempool_version
    }

    pub fn current(&self) -> Option<Arc<BlockTemplate>> {
        let state = self.lock();
        state.last_tip.and(state.cached.clone())
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
