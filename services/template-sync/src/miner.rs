//! Background miner workers driving the proof search one block at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gbt_protocol::MinerStatus;
use tracing::{info, warn};

use crate::error::{MiningError, MiningResult};
use crate::service::{MiningService, decode_payout_script};

const ERROR_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_MINER_THREADS: u32 = 256;

struct Running {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Running {
    fn is_active(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }
}

pub struct BackgroundMiner {
    service: Arc<MiningService>,
    running: Mutex<Option<Running>>,
    blocks_found: Arc<AtomicU64>,
}

impl BackgroundMiner {
    pub fn new(service: Arc<MiningService>) -> Self {
        BackgroundMiner {
            service,
            running: Mutex::new(None),
            blocks_found: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Starts `nthreads` workers sharing one stop flag. Workers draw
    /// coinbase extra nonces from the service, so they never grind the same
    /// block.
    pub fn start(
        &self,
        payout_script_hex: &str,
        nthreads: u32,
        max_tries: Option<u64>,
    ) -> MiningResult<()> {
        if !(1..=MAX_MINER_THREADS).contains(&nthreads) {
            return Err(MiningError::InvalidInput(format!(
                "nthreads must be between 1 and {MAX_MINER_THREADS}"
            )));
        }
        let script: Arc<[u8]> = decode_payout_script(payout_script_hex)?.into();
        if self.service.coordinator().is_shutting_down() {
            return Err(MiningError::Unavailable("Shutting down".to_string()));
        }

        let mut running = self.lock();
        if running.as_ref().is_some_and(Running::is_active) {
            return Err(MiningError::InvalidInput("miner already running".to_string()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(nthreads as usize);
        for i in 0..nthreads {
            let service = self.service.clone();
            let found = self.blocks_found.clone();
            let flag = stop.clone();
            let script = script.clone();
            let spawned = thread::Builder::new()
                .name(format!("miner-{i}"))
                .spawn(move || mine(&service, &script, max_tries, &flag, &found));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    stop.store(true, Ordering::SeqCst);
                    join_all(handles);
                    return Err(MiningError::Internal(format!("spawn miner thread: {e}")));
                }
            }
        }

        info!(payout = payout_script_hex, nthreads, "background miner started");
        *running = Some(Running { stop, handles });
        Ok(())
    }

    /// Signals every worker and waits for them to exit. Returns false if the
    /// miner was not running.
    pub fn stop(&self) -> bool {
        let Some(running) = self.lock().take() else {
            return false;
        };
        running.stop.store(true, Ordering::SeqCst);
        join_all(running.handles);
        info!(
            blocks_found = self.blocks_found.load(Ordering::Relaxed),
            "background miner stopped"
        );
        true
    }

    pub fn status(&self) -> MinerStatus {
        let running = self.lock();
        let nthreads = running
            .as_ref()
            .filter(|r| r.is_active())
            .map_or(0, |r| r.handles.len() as u32);
        MinerStatus {
            status: if nthreads > 0 { "active" } else { "stopped" }.to_string(),
            blocks_found: self.blocks_found.load(Ordering::Relaxed),
            nthreads,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        match self.running.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            warn!("miner thread panicked");
        }
    }
}

fn mine(
    service: &MiningService,
    script: &[u8],
    max_tries: Option<u64>,
    stop: &AtomicBool,
    found: &AtomicU64,
) {
    while !stop.load(Ordering::Relaxed) && !service.coordinator().is_shutting_down() {
        match service.search_with_script(script, 1, max_tries, stop) {
            Ok(hashes) => {
                found.fetch_add(hashes.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "miner search failed, backing off");
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ValidationGateway;
    use crate::service::tests::service;
    use std::time::Instant;

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn start_mine_stop() {
        let (svc, chain) = service();
        let miner = BackgroundMiner::new(svc);
        assert_eq!(miner.status().status, "stopped");
        assert_eq!(miner.status().nthreads, 0);

        miner.start("51", 1, None).unwrap();
        assert_eq!(miner.status().status, "active");
        assert_eq!(miner.status().nthreads, 1);
        assert!(matches!(
            miner.start("51", 1, None),
            Err(MiningError::InvalidInput(_))
        ));

        assert!(wait_for(|| miner.status().blocks_found >= 2));
        assert!(miner.stop());

        let status = miner.status();
        assert_eq!(status.status, "stopped");
        assert_eq!(status.nthreads, 0);
        assert_eq!(
            chain.current_tip().unwrap().height as u64,
            status.blocks_found
        );
        assert!(!miner.stop());
    }

    #[test]
    fn several_workers_extend_one_chain() {
        let (svc, chain) = service();
        let miner = BackgroundMiner::new(svc);
        miner.start("51", 4, None).unwrap();
        assert_eq!(miner.status().nthreads, 4);

        assert!(wait_for(|| chain.current_tip().unwrap().height >= 5));
        assert!(miner.stop());

        let status = miner.status();
        assert_eq!(status.status, "stopped");
        assert_eq!(status.nthreads, 0);
        // workers racing on one tip may also land side-branch blocks
        assert!(status.blocks_found >= chain.current_tip().unwrap().height as u64);
    }

    #[test]
    fn thread_count_is_bounded() {
        let (svc, _) = service();
        let miner = BackgroundMiner::new(svc);
        for n in [0, MAX_MINER_THREADS + 1] {
            assert!(matches!(
                miner.start("51", n, None),
                Err(MiningError::InvalidInput(_))
            ));
        }
        assert_eq!(miner.status().status, "stopped");
    }

    #[test]
    fn rejects_bad_script() {
        let (svc, _) = service();
        let miner = BackgroundMiner::new(svc);
        assert!(matches!(
            miner.start("xyz", 1, None),
            Err(MiningError::InvalidInput(_))
        ));
        assert_eq!(miner.status().status, "stopped");
    }

    #[test]
    fn service_shutdown_ends_mining() {
        let (svc, _) = service();
        let miner = BackgroundMiner::new(svc.clone());
        miner.start("51", 2, None).unwrap();
        svc.shutdown();
        assert!(wait_for(|| miner.status().status == "stopped"));
        assert!(miner.start("51", 2, None).is_err());
    }
}
