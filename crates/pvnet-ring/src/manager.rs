//! # Channel Manager
//!
//! Negotiates topology with the remote, binds one transmit ring and one
//! receive ring to every granted channel, keeps the RSS indirection table
//! valid for the active queue count, and drives the suspend/detach sequence
//! used for live reconfiguration.
//!
//! ## Attach
//!
//! ```text
//! open(0) ─▶ Init ─▶ Config{mtu} ─▶ SubchannelRequest ─▶ open(1..n)
//!        ─▶ RegisterRecvRegion × n ─▶ bind rings ─▶ SetRss ─▶ activate
//! ```
//!
//! Only the primary channel is mandatory. A refused or short sub-channel
//! grant degrades to however many channels actually opened.
//!
//! ## Suspend
//!
//! TX quiesce always completes before RX teardown begins:
//!
//! 1. every transmit ring stops accepting packets;
//! 2. wait (bounded, with backoff) for in-flight descriptors to reach zero;
//! 3. `StopReceive` per channel, then drain remaining inbound messages.
//!
//! A drain timeout restores the transmit rings to `Active` and reports
//! [`ManagerError::DrainTimeout`], leaving the device as it was.

use std::sync::Arc;
use std::time::Duration;

use quanta::Instant;
use tracing::{error, info, warn};

use crate::channel::{Channel, ChannelHandle, ChannelTransport, ReceiveRegion};
use crate::config::{DeviceConfig, MAX_QUEUES};
use crate::error::{EnqueueError, ManagerError};
use crate::packet::PacketDescriptor;
use crate::rss::{FlowTuple, RssTable, SharedRssTable, Toeplitz};
use crate::rx::{PacketSink, ReceiveRing};
use crate::state::DeviceState;
use crate::stats::{DeviceStats, QueueStats};
use crate::tx::TransmitRing;
use crate::wire::{ControlMessage, Status, CONTROL_VERSION_1, CONTROL_VERSION_2};

const DRAIN_BACKOFF_START: Duration = Duration::from_micros(50);
const DRAIN_BACKOFF_MAX: Duration = Duration::from_millis(5);

/// Number of queues actually running after attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActiveQueueCount(pub u16);

impl ActiveQueueCount {
    pub fn get(self) -> u16 {
        self.0
    }
}

/// Outcome of a successful [`ChannelManager::reconfigure`].
#[derive(Debug)]
pub struct Reconfigured {
    pub active: ActiveQueueCount,
    /// Packets that were queued but never sent before the old rings were
    /// detached. The caller re-enqueues or drops them.
    pub returned: Vec<PacketDescriptor>,
}

/// A channel opened during attach, before its rings exist.
struct Opened {
    index: u16,
    handle: ChannelHandle,
    region: Option<(Arc<ReceiveRegion>, u32)>,
}

pub struct ChannelManager {
    transport: Arc<dyn ChannelTransport>,
    config: DeviceConfig,
    sink: Arc<dyn PacketSink>,
    channels: Vec<Arc<Channel>>,
    rss: Arc<SharedRssTable>,
    toeplitz: Toeplitz,
    negotiated_version: u32,
    state: DeviceState,
    /// Packets recovered from a reconfiguration whose re-attach failed.
    unsent: Vec<PacketDescriptor>,
}

impl ChannelManager {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        config: DeviceConfig,
        sink: Arc<dyn PacketSink>,
    ) -> Result<Self, ManagerError> {
        config.validate().map_err(ManagerError::Config)?;
        let rss = Arc::new(SharedRssTable::new(RssTable::new(config.rss_table_size, 1)));
        let toeplitz = Toeplitz::new(config.rss_key);
        Ok(ChannelManager {
            transport,
            config,
            sink,
            channels: Vec::new(),
            rss,
            toeplitz,
            negotiated_version: 0,
            state: DeviceState::Detached,
            unsent: Vec::new(),
        })
    }

    fn expect_state(&self, expected: DeviceState) -> Result<(), ManagerError> {
        if self.state != expected {
            return Err(ManagerError::InvalidState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    fn control(
        &self,
        channel: ChannelHandle,
        request: ControlMessage,
    ) -> Result<ControlMessage, ManagerError> {
        let reply = self.transport.control(channel, request.to_bytes())?;
        Ok(ControlMessage::decode(&reply)?)
    }

    // ─── Attach ─────────────────────────────────────────────────────────

    /// Open and bind up to `requested` queues.
    ///
    /// Fails only if the primary channel cannot be set up or the grant falls
    /// below the configured floor.
    pub fn attach_all(&mut self, requested: u16) -> Result<ActiveQueueCount, ManagerError> {
        self.expect_state(DeviceState::Detached)?;
        let requested = requested.clamp(1, MAX_QUEUES);
        let primary = self.transport.open(0, self.config.pool_size)?;
        let mut opened = vec![Opened {
            index: 0,
            handle: primary,
            region: None,
        }];

        match self.attach_opened(requested, &mut opened) {
            Ok(active) => Ok(active),
            Err(e) => {
                for ch in opened.iter().rev() {
                    self.transport.close(ch.handle);
                }
                for channel in self.channels.drain(..).rev() {
                    channel.mark_closed();
                    self.transport.close(channel.handle());
                }
                self.negotiated_version = 0;
                error!(error = %e, "attach failed");
                Err(e)
            }
        }
    }

    fn attach_opened(
        &mut self,
        requested: u16,
        opened: &mut Vec<Opened>,
    ) -> Result<ActiveQueueCount, ManagerError> {
        let primary = opened[0].handle;
        let version = self.negotiate(primary)?;
        self.negotiated_version = version;

        match self.control(primary, ControlMessage::Config { mtu: self.config.mtu })? {
            ControlMessage::Ack {
                status: Status::Success,
            } => {}
            other => {
                return Err(ManagerError::NegotiationFailed(format!(
                    "remote rejected MTU {}: {:?}",
                    self.config.mtu, other
                )))
            }
        }

        let granted = self.request_subchannels(primary, requested, version);
        for index in 1..=granted {
            match self.transport.open(index, self.config.pool_size) {
                Ok(handle) => opened.push(Opened {
                    index,
                    handle,
                    region: None,
                }),
                Err(e) => {
                    warn!(channel = index, error = %e, "sub-channel open failed, continuing with fewer queues");
                    break;
                }
            }
        }

        self.register_regions(primary, opened)?;

        let floor = self.config.min_queue_count.min(requested);
        if (opened.len() as u16) < floor {
            return Err(ManagerError::NegotiationFailed(format!(
                "{} of {} queues granted, minimum is {}",
                opened.len(),
                requested,
                floor
            )));
        }

        self.bind_rings(opened)?;
        let active = self.channels.len() as u16;
        self.publish_rss(primary, active, version);

        for channel in &self.channels {
            channel.tx().activate()?;
            channel.with_rx(|rx| rx.activate())?;
        }
        self.state = DeviceState::Active;
        info!(requested, active, version, mtu = self.config.mtu, "channels attached");
        Ok(ActiveQueueCount(active))
    }

    fn negotiate(&self, primary: ChannelHandle) -> Result<u32, ManagerError> {
        let reply = self.control(
            primary,
            ControlMessage::Init {
                min_version: CONTROL_VERSION_1,
                max_version: CONTROL_VERSION_2,
            },
        )?;
        match reply {
            ControlMessage::InitComplete {
                status: Status::Success,
                version,
            } if (CONTROL_VERSION_1..=CONTROL_VERSION_2).contains(&version) => Ok(version),
            other => Err(ManagerError::NegotiationFailed(format!(
                "version negotiation refused: {:?}",
                other
            ))),
        }
    }

    /// Number of sub-channels granted. Any failure means zero.
    fn request_subchannels(&self, primary: ChannelHandle, requested: u16, version: u32) -> u16 {
        if requested <= 1 {
            return 0;
        }
        if version < CONTROL_VERSION_2 {
            warn!(version, requested, "remote has no sub-channel support, using one queue");
            return 0;
        }
        let wanted = requested - 1;
        match self.control(primary, ControlMessage::SubchannelRequest { count: wanted }) {
            Ok(ControlMessage::SubchannelComplete {
                status: Status::Success,
                granted,
            }) => {
                if granted < wanted {
                    warn!(requested, granted = granted + 1, "remote granted fewer queues");
                }
                granted.min(wanted)
            }
            Ok(other) => {
                warn!(reply = ?other, "sub-channel request refused, using one queue");
                0
            }
            Err(e) => {
                warn!(error = %e, "sub-channel request failed, using one queue");
                0
            }
        }
    }

    /// Share and register one receive region per channel. A sub-channel whose
    /// region is refused is closed along with every channel after it.
    fn register_regions(
        &self,
        primary: ChannelHandle,
        opened: &mut Vec<Opened>,
    ) -> Result<(), ManagerError> {
        let size = self.config.recv_region_size;
        let mut keep = opened.len();
        for (pos, ch) in opened.iter_mut().enumerate() {
            let result = self.register_region(primary, ch.index, ch.handle, size);
            match result {
                Ok(region) => ch.region = Some(region),
                Err(e) if ch.index == 0 => return Err(e),
                Err(e) => {
                    warn!(channel = ch.index, error = %e, "receive region refused, dropping channel");
                    keep = pos;
                    break;
                }
            }
        }
        for ch in opened.drain(keep..) {
            self.transport.close(ch.handle);
        }
        Ok(())
    }

    fn register_region(
        &self,
        primary: ChannelHandle,
        index: u16,
        handle: ChannelHandle,
        size: usize,
    ) -> Result<(Arc<ReceiveRegion>, u32), ManagerError> {
        let region = Arc::new(ReceiveRegion::new(size));
        let region_id = self.transport.share_region(handle, region.clone())?;
        match self.control(
            primary,
            ControlMessage::RegisterRecvRegion {
                channel: index,
                region_id,
                size: size as u32,
            },
        )? {
            ControlMessage::RecvRegionComplete {
                status: Status::Success,
                ..
            } => Ok((region, region_id)),
            other => Err(ManagerError::NegotiationFailed(format!(
                "receive region {} on channel {} refused: {:?}",
                region_id, index, other
            ))),
        }
    }

    fn bind_rings(&mut self, opened: &mut Vec<Opened>) -> Result<(), ManagerError> {
        let tx_config = self.config.tx_ring_config();
        let rx_config = self.config.rx_ring_config();
        for ch in opened.drain(..) {
            let Some((region, region_id)) = ch.region else {
                self.transport.close(ch.handle);
                continue;
            };
            let tx = Arc::new(TransmitRing::new(ch.index, self.transport.clone(), &tx_config));
            tx.attach(ch.handle)?;
            let rx = ReceiveRing::new(
                ch.index,
                ch.handle,
                self.transport.clone(),
                region.clone(),
                self.sink.clone(),
                &rx_config,
            );
            rx.attach()?;
            self.channels.push(Arc::new(Channel::new(
                ch.index,
                ch.handle,
                self.config.pool_size,
                region,
                region_id,
                tx,
                rx,
            )));
        }
        Ok(())
    }

    /// Fix up the indirection table for `active` queues and push it to the
    /// remote. Runs before any ring is activated.
    fn publish_rss(&self, primary: ChannelHandle, active: u16, version: u32) {
        let current = self.rss.load();
        let table = if current.len() == self.config.rss_table_size {
            self.rss.resize(active)
        } else {
            self.rss.store(RssTable::new(self.config.rss_table_size, active));
            self.rss.load()
        };
        if active <= 1 || version < CONTROL_VERSION_2 {
            return;
        }
        let request = ControlMessage::SetRss {
            key: self.config.rss_key.to_vec(),
            table: table.entries().to_vec(),
        };
        match self.control(primary, request) {
            Ok(ControlMessage::Ack {
                status: Status::Success,
            }) => {}
            Ok(other) => warn!(reply = ?other, "remote refused RSS parameters"),
            Err(e) => warn!(error = %e, "RSS parameter push failed"),
        }
    }

    // ─── Suspend / detach ───────────────────────────────────────────────

    /// Quiesce transmit, then stop and drain receive.
    pub fn suspend(&mut self) -> Result<(), ManagerError> {
        self.expect_state(DeviceState::Active)?;
        for channel in &self.channels {
            channel.tx().suspend()?;
        }

        if let Err(e) = self.drain_transmit() {
            for channel in &self.channels {
                if let Err(resume) = channel.tx().resume() {
                    warn!(error = %resume, "transmit ring did not resume");
                }
            }
            return Err(e);
        }

        if let Some(primary) = self.primary() {
            for channel in &self.channels {
                let request = ControlMessage::StopReceive {
                    channel: channel.index(),
                };
                if let Err(e) = self.control(primary, request) {
                    warn!(channel = channel.index(), error = %e, "stop-receive failed");
                }
            }
        }
        for channel in &self.channels {
            channel.with_rx(|rx| rx.suspend())?;
            loop {
                let report = channel.with_rx(|rx| rx.on_channel_notify(Some(&**channel.tx())));
                if !report.did_work() {
                    break;
                }
            }
        }
        self.state = DeviceState::Suspended;
        info!(queues = self.channels.len(), "device suspended");
        Ok(())
    }

    /// Wait until every transmit ring has zero descriptors in flight.
    fn drain_transmit(&self) -> Result<(), ManagerError> {
        let deadline = self.config.drain_timeout;
        let start = Instant::now();
        let mut backoff = DRAIN_BACKOFF_START;
        loop {
            for channel in &self.channels {
                channel.poll_inbound();
            }
            let pending: usize = self.channels.iter().map(|c| c.tx().in_flight()).sum();
            if pending == 0 {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= deadline {
                error!(pending, ?waited, "transmit drain timed out");
                return Err(ManagerError::DrainTimeout { pending, waited });
            }
            std::thread::sleep(backoff.min(deadline - waited));
            backoff = (backoff * 2).min(DRAIN_BACKOFF_MAX);
        }
    }

    /// Unbind every ring, revoke receive regions and close all channels.
    ///
    /// Returns packets that were queued but never sent.
    pub fn detach_all(&mut self) -> Result<Vec<PacketDescriptor>, ManagerError> {
        match self.state {
            DeviceState::Detached => return Ok(Vec::new()),
            DeviceState::Active => {
                return Err(ManagerError::InvalidState {
                    expected: DeviceState::Suspended,
                    found: DeviceState::Active,
                })
            }
            DeviceState::Suspended => {}
        }

        let mut returned = Vec::new();
        for channel in &self.channels {
            returned.extend(channel.tx().detach()?);
            channel.with_rx(|rx| rx.detach())?;
        }
        if let Some(primary) = self.primary() {
            for channel in &self.channels {
                let request = ControlMessage::RevokeRecvRegion {
                    channel: channel.index(),
                    region_id: channel.region_id(),
                };
                match self.control(primary, request) {
                    Ok(ControlMessage::Ack {
                        status: Status::Success,
                    }) => {}
                    Ok(other) => warn!(channel = channel.index(), reply = ?other, "region revoke refused"),
                    Err(e) => warn!(channel = channel.index(), error = %e, "region revoke failed"),
                }
            }
        }
        // Sub-channels close before the primary.
        for channel in self.channels.iter().rev() {
            channel.mark_closed();
            self.transport.close(channel.handle());
        }
        let queues = self.channels.len();
        self.channels.clear();
        self.state = DeviceState::Detached;
        info!(queues, returned = returned.len(), "channels detached");
        Ok(returned)
    }

    /// Apply a new configuration through suspend, detach and re-attach.
    ///
    /// On a drain timeout the device stays active with the old configuration.
    /// If re-attach fails, the device is left detached and the unsent packets
    /// are kept for [`ChannelManager::take_unsent`].
    pub fn reconfigure(&mut self, config: DeviceConfig) -> Result<Reconfigured, ManagerError> {
        config.validate().map_err(ManagerError::Config)?;
        if self.state == DeviceState::Active {
            self.suspend()?;
        }
        let returned = self.detach_all()?;
        info!(
            queues = config.queue_count,
            mtu = config.mtu,
            "reconfiguring device"
        );
        self.toeplitz = Toeplitz::new(config.rss_key);
        self.config = config;
        match self.attach_all(self.config.queue_count) {
            Ok(active) => Ok(Reconfigured { active, returned }),
            Err(e) => {
                self.unsent.extend(returned);
                Err(e)
            }
        }
    }

    /// Suspend (forcing past a drain timeout) and detach.
    pub fn shutdown(&mut self) -> Vec<PacketDescriptor> {
        if self.state == DeviceState::Active {
            if let Err(e) = self.suspend() {
                error!(error = %e, "forcing shutdown");
                for channel in &self.channels {
                    if let Err(e) = channel.tx().suspend() {
                        warn!(channel = channel.index(), error = %e, "transmit ring did not suspend");
                    }
                    if let Err(e) = channel.with_rx(|rx| rx.suspend()) {
                        warn!(channel = channel.index(), error = %e, "receive ring did not suspend");
                    }
                }
                self.state = DeviceState::Suspended;
            }
        }
        let mut returned = std::mem::take(&mut self.unsent);
        match self.detach_all() {
            Ok(packets) => returned.extend(packets),
            Err(e) => error!(error = %e, "detach during shutdown failed"),
        }
        returned
    }

    pub fn take_unsent(&mut self) -> Vec<PacketDescriptor> {
        std::mem::take(&mut self.unsent)
    }

    // ─── Producer helpers ───────────────────────────────────────────────

    /// Enqueue on a specific queue.
    pub fn enqueue(&self, queue: u16, packet: PacketDescriptor) -> Result<(), EnqueueError> {
        match self.channels.get(queue as usize) {
            Some(channel) => channel.tx().enqueue(packet),
            None => Err(EnqueueError::RingSuspended(packet)),
        }
    }

    /// Queue for a flow hash, via the indirection table.
    pub fn select_queue(&self, hash: u32) -> u16 {
        self.rss.select(hash)
    }

    /// Queue for a flow tuple, hashed with the configured key.
    pub fn queue_for_flow(&self, tuple: &FlowTuple) -> u16 {
        self.select_queue(self.toeplitz.hash_flow(tuple).value)
    }

    /// Enqueue on the queue chosen by the packet's flow hash, or queue 0.
    pub fn enqueue_hashed(&self, packet: PacketDescriptor) -> Result<(), EnqueueError> {
        let queue = packet.flow_hash.map_or(0, |h| self.select_queue(h.value));
        self.enqueue(queue, packet)
    }

    /// Service every channel once. Returns `true` if any did work.
    pub fn poll(&self, budget: usize) -> bool {
        let mut busy = false;
        for channel in &self.channels {
            busy |= channel.service(budget);
        }
        busy
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    fn primary(&self) -> Option<ChannelHandle> {
        self.channels.first().map(|c| c.handle())
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn tx_rings(&self) -> Vec<Arc<TransmitRing>> {
        self.channels.iter().map(|c| c.tx().clone()).collect()
    }

    pub fn rss(&self) -> &Arc<SharedRssTable> {
        &self.rss
    }

    pub fn toeplitz(&self) -> &Toeplitz {
        &self.toeplitz
    }

    pub fn active_queues(&self) -> ActiveQueueCount {
        ActiveQueueCount(self.channels.len() as u16)
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn negotiated_version(&self) -> u32 {
        self.negotiated_version
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.channels.iter().map(|c| c.tx().in_flight()).sum()
    }

    pub fn stats(&self) -> DeviceStats {
        let queues = self
            .channels
            .iter()
            .map(|c| {
                let tx = c.tx();
                QueueStats {
                    queue: c.index(),
                    state: tx.state().as_str(),
                    in_flight: tx.in_flight(),
                    backlog: tx.backlog_len(),
                    backpressured: tx.is_backpressured(),
                    tx: tx.stats(),
                    rx: c.with_rx(|rx| rx.stats()),
                }
            })
            .collect();
        DeviceStats {
            active_queues: self.channels.len() as u16,
            protocol_version: self.negotiated_version,
            mtu: self.config.mtu,
            queues,
        }
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("state", &self.state)
            .field("channels", &self.channels.len())
            .field("version", &self.negotiated_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackConfig, LoopbackTransport};
    use crate::state::RingState;
    use crate::wire::ControlKind;
    use bytes::Bytes;
    use crossbeam_channel::Receiver;

    fn manager(
        remote: LoopbackConfig,
        config: DeviceConfig,
    ) -> (Arc<LoopbackTransport>, ChannelManager, Receiver<PacketDescriptor>) {
        let transport = Arc::new(LoopbackTransport::new(remote));
        let (sink, out) = crossbeam_channel::unbounded();
        let mgr = ChannelManager::new(transport.clone(), config, Arc::new(sink)).unwrap();
        (transport, mgr, out)
    }

    fn small_config() -> DeviceConfig {
        DeviceConfig {
            pool_size: 8,
            recv_region_size: 64 * 1024,
            drain_timeout: Duration::from_millis(50),
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn single_queue_attach() {
        let (transport, mut mgr, _out) = manager(LoopbackConfig::default(), small_config());
        assert_eq!(mgr.attach_all(1).unwrap(), ActiveQueueCount(1));
        assert_eq!(mgr.state(), DeviceState::Active);
        assert_eq!(transport.mtu(), Some(1500));
        assert!(transport.has_region(0));
        // One queue: no sub-channel request, no RSS push.
        let log = transport.control_log();
        assert!(!log.contains(&ControlKind::SubchannelRequest));
        assert!(!log.contains(&ControlKind::SetRss));
    }

    #[test]
    fn attach_order_of_control_messages() {
        let (transport, mut mgr, _out) = manager(LoopbackConfig::default(), small_config());
        mgr.attach_all(2).unwrap();
        assert_eq!(
            transport.control_log(),
            vec![
                ControlKind::Init,
                ControlKind::Config,
                ControlKind::SubchannelRequest,
                ControlKind::RegisterRecvRegion,
                ControlKind::RegisterRecvRegion,
                ControlKind::SetRss,
            ]
        );
    }

    #[test]
    fn partial_grant_proceeds() {
        let remote = LoopbackConfig {
            max_channels: 2,
            ..Default::default()
        };
        let (transport, mut mgr, _out) = manager(remote, small_config());
        assert_eq!(mgr.attach_all(4).unwrap(), ActiveQueueCount(2));
        assert!(mgr.rss().load().entries().iter().all(|&e| e < 2));
        let (key, table) = transport.rss().unwrap();
        assert_eq!(key, mgr.config().rss_key.to_vec());
        assert_eq!(table.len(), 256);
    }

    #[test]
    fn refused_subchannels_fall_back_to_one_queue() {
        let remote = LoopbackConfig {
            fail_subchannel_request: true,
            ..Default::default()
        };
        let (_t, mut mgr, _out) = manager(remote, small_config());
        assert_eq!(mgr.attach_all(8).unwrap(), ActiveQueueCount(1));
        assert!(mgr.rss().load().entries().iter().all(|&e| e == 0));
    }

    #[test]
    fn old_remote_gets_one_queue() {
        let remote = LoopbackConfig {
            version: CONTROL_VERSION_1,
            ..Default::default()
        };
        let (transport, mut mgr, _out) = manager(remote, small_config());
        assert_eq!(mgr.attach_all(4).unwrap(), ActiveQueueCount(1));
        assert_eq!(mgr.negotiated_version(), CONTROL_VERSION_1);
        assert!(!transport.control_log().contains(&ControlKind::SubchannelRequest));
    }

    #[test]
    fn failed_subchannel_open_truncates() {
        let remote = LoopbackConfig {
            fail_open_at: Some(2),
            ..Default::default()
        };
        let (_t, mut mgr, _out) = manager(remote, small_config());
        assert_eq!(mgr.attach_all(4).unwrap(), ActiveQueueCount(2));
    }

    #[test]
    fn primary_failure_is_fatal() {
        let remote = LoopbackConfig {
            fail_open_at: Some(0),
            ..Default::default()
        };
        let (_t, mut mgr, _out) = manager(remote, small_config());
        assert!(matches!(mgr.attach_all(2), Err(ManagerError::Transport(_))));
        assert_eq!(mgr.state(), DeviceState::Detached);
    }

    #[test]
    fn refused_init_is_fatal() {
        let remote = LoopbackConfig {
            version: 0,
            ..Default::default()
        };
        let (transport, mut mgr, _out) = manager(remote, small_config());
        assert!(matches!(mgr.attach_all(1), Err(ManagerError::NegotiationFailed(_))));
        assert_eq!(transport.control_log(), vec![ControlKind::Init]);
        assert!(!transport.is_open(0));
        assert!(mgr.channels().is_empty());
    }

    #[test]
    fn grant_below_floor_fails() {
        let remote = LoopbackConfig {
            max_channels: 2,
            ..Default::default()
        };
        let config = DeviceConfig {
            queue_count: 4,
            min_queue_count: 3,
            ..small_config()
        };
        let (transport, mut mgr, _out) = manager(remote, config);
        assert!(matches!(mgr.attach_all(4), Err(ManagerError::NegotiationFailed(_))));
        assert!(!transport.is_open(0));
        assert!(!transport.is_open(1));
    }

    #[test]
    fn attach_twice_is_invalid() {
        let (_t, mut mgr, _out) = manager(LoopbackConfig::default(), small_config());
        mgr.attach_all(1).unwrap();
        assert!(matches!(
            mgr.attach_all(1),
            Err(ManagerError::InvalidState {
                expected: DeviceState::Detached,
                found: DeviceState::Active
            })
        ));
    }

    #[test]
    fn suspend_then_detach_returns_unsent() {
        let (transport, mut mgr, _out) = manager(LoopbackConfig::default(), small_config());
        mgr.attach_all(2).unwrap();
        mgr.enqueue(0, PacketDescriptor::new(Bytes::from_static(b"a"))).unwrap();
        mgr.enqueue(1, PacketDescriptor::new(Bytes::from_static(b"b"))).unwrap();
        mgr.poll(1);
        mgr.enqueue(0, PacketDescriptor::new(Bytes::from_static(b"c"))).unwrap();

        mgr.suspend().unwrap();
        assert_eq!(mgr.in_flight(), 0);
        assert!(transport.receive_stopped(0) && transport.receive_stopped(1));
        assert!(mgr.enqueue(0, PacketDescriptor::default()).unwrap_err().is_suspended());

        let returned = mgr.detach_all().unwrap();
        assert_eq!(returned.len(), 1);
        assert_eq!(&returned[0].payload[..], b"c");
        assert!(!transport.is_open(0) && !transport.has_region(0));
        assert_eq!(mgr.state(), DeviceState::Detached);
    }

    #[test]
    fn detach_requires_suspend() {
        let (_t, mut mgr, _out) = manager(LoopbackConfig::default(), small_config());
        mgr.attach_all(1).unwrap();
        assert!(matches!(mgr.detach_all(), Err(ManagerError::InvalidState { .. })));
    }

    #[test]
    fn drain_timeout_restores_active() {
        let remote = LoopbackConfig {
            defer_completions: true,
            ..Default::default()
        };
        let (transport, mut mgr, _out) = manager(remote, small_config());
        mgr.attach_all(1).unwrap();
        mgr.enqueue(0, PacketDescriptor::new(Bytes::from_static(b"stuck"))).unwrap();
        mgr.poll(4);
        assert_eq!(transport.pending_completions(0), 1);

        match mgr.suspend() {
            Err(ManagerError::DrainTimeout { pending, .. }) => assert_eq!(pending, 1),
            other => panic!("expected DrainTimeout, got {other:?}"),
        }
        assert_eq!(mgr.state(), DeviceState::Active);
        assert_eq!(mgr.channels()[0].tx().state(), RingState::Active);

        transport.complete_pending(0, 1);
        mgr.suspend().unwrap();
        assert_eq!(mgr.in_flight(), 0);
    }

    #[test]
    fn forced_shutdown_after_drain_timeout() {
        let remote = LoopbackConfig {
            defer_completions: true,
            ..Default::default()
        };
        let (transport, mut mgr, _out) = manager(remote, small_config());
        mgr.attach_all(1).unwrap();
        mgr.enqueue(0, PacketDescriptor::new(Bytes::from_static(b"stuck"))).unwrap();
        mgr.poll(4);
        mgr.enqueue(0, PacketDescriptor::new(Bytes::from_static(b"queued"))).unwrap();

        let returned = mgr.shutdown();
        assert_eq!(returned.len(), 1);
        assert_eq!(&returned[0].payload[..], b"queued");
        assert_eq!(mgr.state(), DeviceState::Detached);
        assert!(mgr.channels().is_empty());
        assert!(!transport.is_open(0));
    }

    #[test]
    fn reconfigure_changes_mtu_and_queues() {
        let (transport, mut mgr, _out) = manager(LoopbackConfig::default(), small_config());
        mgr.attach_all(1).unwrap();
        let next = small_config().with_mtu(9000).with_queue_count(3);
        let done = mgr.reconfigure(next).unwrap();
        assert_eq!(done.active, ActiveQueueCount(3));
        assert!(done.returned.is_empty());
        assert_eq!(transport.mtu(), Some(9000));
        assert_eq!(mgr.channels()[0].with_rx(|rx| rx.mtu()), 9000);
        assert!(mgr.rss().load().is_valid());
    }

    #[test]
    fn enqueue_hashed_follows_table() {
        let (_t, mut mgr, _out) = manager(LoopbackConfig::default(), small_config());
        mgr.attach_all(4).unwrap();
        let pkt = PacketDescriptor::new(Bytes::from_static(b"flow"))
            .with_flow_hash(6, crate::packet::HashType::Opaque);
        mgr.enqueue_hashed(pkt).unwrap();
        let expected = mgr.select_queue(6) as usize;
        assert_eq!(mgr.channels()[expected].tx().backlog_len(), 1);
        assert!(mgr.enqueue(9, PacketDescriptor::default()).is_err());
    }

    #[test]
    fn invalid_config_rejected() {
        let transport = Arc::new(LoopbackTransport::new(LoopbackConfig::default()));
        let (sink, _out) = crossbeam_channel::unbounded::<PacketDescriptor>();
        let bad = DeviceConfig::default().with_mtu(10);
        assert!(matches!(
            ChannelManager::new(transport, bad, Arc::new(sink)),
            Err(ManagerError::Config(_))
        ));
    }
}
