use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use tracing::{debug, error, info, warn};

use pvnet_ring::channel::{Channel, ChannelTransport};
use pvnet_ring::config::DeviceConfig;
use pvnet_ring::rss::SharedRssTable;
use pvnet_ring::rx::PacketSink;
use pvnet_ring::state::DeviceState;
use pvnet_ring::stats::DeviceStats;
use pvnet_ring::{ActiveQueueCount, ChannelManager, EnqueueError, PacketDescriptor};

/// Packets a worker submits per channel before polling inbound again.
pub const DEFAULT_BUDGET: usize = 32;

const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// Worker threads for one attach generation.
struct Workers {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Workers {
    fn idle() -> Self {
        Workers {
            stop: Arc::new(AtomicBool::new(true)),
            handles: Vec::new(),
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("queue worker panicked");
            }
        }
    }
}

/// Thread-safe handle to a running paravirtual NIC.
///
/// Owns one worker thread per active queue. Each worker services its
/// channel: inbound completions and frames first, then up to `budget`
/// packets from the transmit backlog, sleeping briefly when idle.
///
/// **Hot path** (`try_send`, `try_send_hashed`) reads a lock-free snapshot
/// of the active channels and never touches the manager. **Control path**
/// (reconfiguration, stats, shutdown) serializes on the manager lock.
///
/// Dropping the runtime performs a graceful shutdown.
pub struct DeviceRuntime {
    manager: Mutex<ChannelManager>,
    channels: Arc<ArcSwap<Vec<Arc<Channel>>>>,
    rss: Arc<SharedRssTable>,
    workers: Mutex<Workers>,
    budget: usize,
    closed: AtomicBool,
}

impl DeviceRuntime {
    /// Negotiate channels with the remote and start the queue workers.
    pub fn start(
        transport: Arc<dyn ChannelTransport>,
        config: DeviceConfig,
        sink: Arc<dyn PacketSink>,
    ) -> anyhow::Result<Self> {
        Self::with_budget(transport, config, sink, DEFAULT_BUDGET)
    }

    pub fn with_budget(
        transport: Arc<dyn ChannelTransport>,
        config: DeviceConfig,
        sink: Arc<dyn PacketSink>,
        budget: usize,
    ) -> anyhow::Result<Self> {
        let requested = config.queue_count;
        let mut manager =
            ChannelManager::new(transport, config, sink).context("invalid device configuration")?;
        let active = manager
            .attach_all(requested)
            .context("failed to attach channels")?;
        let rss = manager.rss().clone();
        let channels = Arc::new(ArcSwap::from_pointee(manager.channels().to_vec()));

        let runtime = DeviceRuntime {
            manager: Mutex::new(manager),
            channels,
            rss,
            workers: Mutex::new(Workers::idle()),
            budget: budget.max(1),
            closed: AtomicBool::new(false),
        };
        runtime.spawn_workers()?;
        info!(queues = active.get(), "device runtime started");
        Ok(runtime)
    }

    fn lock_manager(&self) -> MutexGuard<'_, ChannelManager> {
        self.manager.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_workers(&self) -> anyhow::Result<()> {
        let channels = self.channels.load_full();
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(channels.len());
        for channel in channels.iter() {
            let channel = channel.clone();
            let worker_stop = stop.clone();
            let budget = self.budget;
            let spawned = thread::Builder::new()
                .name(format!("pvnet-q{}", channel.index()))
                .spawn(move || queue_worker(channel, worker_stop, budget));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    Workers { stop, handles }.stop();
                    return Err(e).context("failed to spawn queue worker");
                }
            }
        }
        let mut workers = self.lock_workers();
        workers.stop();
        *workers = Workers { stop, handles };
        Ok(())
    }

    // ─── Hot path ───────────────────────────────────────────────────────

    /// Queue a packet on a specific queue. Never blocks.
    pub fn try_send(&self, queue: u16, packet: PacketDescriptor) -> Result<(), EnqueueError> {
        match self.channels.load().get(queue as usize) {
            Some(channel) => channel.tx().enqueue(packet),
            None => Err(EnqueueError::RingSuspended(packet)),
        }
    }

    /// Queue a packet on the queue its flow hash maps to, or queue 0.
    pub fn try_send_hashed(&self, packet: PacketDescriptor) -> Result<(), EnqueueError> {
        let queue = packet.flow_hash.map_or(0, |h| self.rss.select(h.value));
        self.try_send(queue, packet)
    }

    // ─── Control path ───────────────────────────────────────────────────

    /// Apply `config` live. Packets queued on the old rings are re-queued on
    /// the new ones; any that no longer fit are returned.
    ///
    /// If the transmit drain times out the device keeps running with its old
    /// configuration.
    pub fn reconfigure(&self, config: DeviceConfig) -> anyhow::Result<Vec<PacketDescriptor>> {
        anyhow::ensure!(self.is_running(), "device runtime is shut down");
        config
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid device configuration")?;
        let mut manager = self.lock_manager();
        if manager.state() == DeviceState::Active {
            manager
                .suspend()
                .context("could not quiesce device for reconfiguration")?;
        }

        self.lock_workers().stop();
        self.channels.store(Arc::new(Vec::new()));

        let result = manager.reconfigure(config);
        let done = match result {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "re-attach failed, device detached");
                return Err(e).context("re-attach after reconfiguration failed");
            }
        };

        self.channels.store(Arc::new(manager.channels().to_vec()));
        drop(manager);
        self.spawn_workers()?;

        let mut leftover = Vec::new();
        let requeued = done.returned.len();
        for packet in done.returned {
            if let Err(e) = self.try_send_hashed(packet) {
                leftover.push(e.into_packet());
            }
        }
        info!(
            queues = done.active.get(),
            requeued = requeued - leftover.len(),
            leftover = leftover.len(),
            "device reconfigured"
        );
        Ok(leftover)
    }

    /// Change the MTU through a full reconfiguration.
    pub fn set_mtu(&self, mtu: u32) -> anyhow::Result<Vec<PacketDescriptor>> {
        let config = self.config().with_mtu(mtu);
        self.reconfigure(config)
    }

    /// Change the requested queue count through a full reconfiguration.
    pub fn set_queue_count(&self, queues: u16) -> anyhow::Result<Vec<PacketDescriptor>> {
        let config = self.config().with_queue_count(queues);
        self.reconfigure(config)
    }

    /// Stop the workers, then suspend and detach. Returns packets never
    /// sent. Idempotent.
    ///
    /// Waits at most one drain timeout for in-flight sends.
    pub fn shutdown(&self) -> Vec<PacketDescriptor> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let mut manager = self.lock_manager();
        self.lock_workers().stop();
        self.channels.store(Arc::new(Vec::new()));
        let returned = manager.shutdown();
        info!(returned = returned.len(), "device runtime stopped");
        returned
    }

    /// Packets stranded by a failed re-attach.
    pub fn take_unsent(&self) -> Vec<PacketDescriptor> {
        self.lock_manager().take_unsent()
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn config(&self) -> DeviceConfig {
        self.lock_manager().config().clone()
    }

    pub fn active_queues(&self) -> ActiveQueueCount {
        ActiveQueueCount(self.channels.load().len() as u16)
    }

    pub fn stats(&self) -> DeviceStats {
        self.lock_manager().stats()
    }

    pub fn is_running(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

impl Drop for DeviceRuntime {
    fn drop(&mut self) {
        let dropped = self.shutdown().len();
        if dropped > 0 {
            warn!(dropped, "unsent packets discarded on drop");
        }
    }
}

fn queue_worker(channel: Arc<Channel>, stop: Arc<AtomicBool>, budget: usize) {
    debug!(queue = channel.index(), "queue worker started");
    while !stop.load(Ordering::Relaxed) {
        if !channel.service(budget) {
            thread::sleep(IDLE_SLEEP);
        }
    }
    debug!(queue = channel.index(), "queue worker stopped");
}
