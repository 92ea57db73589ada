//! Per-device (port group) state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::family::CardFamily;
use crate::frame::{pcm_payload_len, PacketHeader, PcmSlots, PcmView, CHUNK_SIZE, SILENCE_BYTE};
use crate::types::{BusId, ChannelSet, DeviceAddr, MAX_CHANNELS};

/// One 8-sample chunk of u-law audio.
pub type Chunk = [u8; CHUNK_SIZE];

const SILENCE_CHUNK: Chunk = [SILENCE_BYTE; CHUNK_SIZE];

#[derive(Debug)]
struct DeviceState {
    offhook: ChannelSet,
    cid_on: ChannelSet,
    digital_signalling: ChannelSet,
    digital_inputs: ChannelSet,
    digital_outputs: ChannelSet,
    mute: ChannelSet,
    silence: ChannelSet,
    wanted_pcm: ChannelSet,
    pcm_wire_len: usize,
    write_chunks: [Chunk; MAX_CHANNELS],
    read_chunks: [Chunk; MAX_CHANNELS],
    last_tick_counter: u64,
}

/// Monotonic per-device event counters.
#[derive(Debug, Default)]
pub struct DeviceCounters {
    /// PCM payloads sent toward the device
    pub pcm_write: AtomicU64,
    /// PCM payloads received from the device
    pub pcm_read: AtomicU64,
    /// Inbound packets that failed validation
    pub recv_errors: AtomicU64,
    /// Tick callbacks delivered
    pub ticks: AtomicU64,
}

/// Diagnostic snapshot of one device.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceSummary {
    /// Address within the bus
    pub addr: DeviceAddr,
    /// Card family name
    pub family: &'static str,
    /// Configured channel count
    pub channels: usize,
    /// Election priority (0 never elected)
    pub timing_priority: u32,
    /// Whether the hardware is present
    pub present: bool,
    /// Channels currently exchanging PCM
    pub wanted_pcm: ChannelSet,
    /// PCM payloads sent
    pub pcm_write: u64,
    /// PCM payloads received
    pub pcm_read: u64,
    /// Validation failures
    pub recv_errors: u64,
}

/// A device (port group) registered behind a bus.
///
/// Channel-state mutators recompute the wanted-PCM mask, so the next tick
/// immediately reflects hook and signalling changes.
#[derive(Debug)]
pub struct Device {
    addr: DeviceAddr,
    bus: BusId,
    channels: usize,
    timing_priority: u32,
    family: Arc<dyn CardFamily>,
    present: AtomicBool,
    state: Mutex<DeviceState>,
    counters: DeviceCounters,
}

impl Device {
    /// Create a device; the caller registers it with its bus.
    #[must_use]
    pub fn new(
        addr: DeviceAddr,
        bus: BusId,
        channels: usize,
        timing_priority: u32,
        family: Arc<dyn CardFamily>,
    ) -> Self {
        let channels = channels.min(MAX_CHANNELS);
        let device = Self {
            addr,
            bus,
            channels,
            timing_priority,
            family,
            present: AtomicBool::new(true),
            state: Mutex::new(DeviceState {
                offhook: ChannelSet::EMPTY,
                cid_on: ChannelSet::EMPTY,
                digital_signalling: ChannelSet::EMPTY,
                digital_inputs: ChannelSet::EMPTY,
                digital_outputs: ChannelSet::EMPTY,
                mute: ChannelSet::EMPTY,
                silence: ChannelSet::EMPTY,
                wanted_pcm: ChannelSet::EMPTY,
                pcm_wire_len: 0,
                write_chunks: [SILENCE_CHUNK; MAX_CHANNELS],
                read_chunks: [SILENCE_CHUNK; MAX_CHANNELS],
                last_tick_counter: 0,
            }),
            counters: DeviceCounters::default(),
        };
        device.pcm_recompute(ChannelSet::EMPTY);
        device
    }

    /// Address within the owning bus.
    #[must_use]
    pub fn addr(&self) -> DeviceAddr {
        self.addr
    }

    /// Owning bus.
    #[must_use]
    pub fn bus(&self) -> BusId {
        self.bus
    }

    /// Configured channel count.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Election priority. Zero means this device never provides timing.
    #[must_use]
    pub fn timing_priority(&self) -> u32 {
        self.timing_priority
    }

    /// Card family driving this device.
    #[must_use]
    pub fn family(&self) -> &Arc<dyn CardFamily> {
        &self.family
    }

    /// Whether the hardware behind this device is present.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    /// Mark the hardware present or gone (disconnect path).
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::Release);
    }

    /// Event counters.
    #[must_use]
    pub fn counters(&self) -> &DeviceCounters {
        &self.counters
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().expect("device state poisoned")
    }

    /// Recompute which channels exchange PCM.
    ///
    /// `extra` adds channels beyond the automatic calculation; families
    /// normally pass the empty set. Off-hook and caller-id channels are
    /// added, digital signalling and digital I/O channels removed. Unit 0
    /// with an otherwise empty mask keeps channel 0 active so the hardware
    /// always sees a sync-carrying PCM packet.
    pub fn pcm_recompute(&self, extra: ChannelSet) {
        let mut state = self.lock();
        let mut wanted = extra | state.offhook | state.cid_on;
        wanted = wanted - state.digital_signalling - state.digital_inputs - state.digital_outputs;
        wanted = wanted & ChannelSet::first_n(self.channels);
        if self.addr.unit() == 0 && wanted.is_empty() {
            wanted = ChannelSet::single(0);
        }
        state.pcm_wire_len = if wanted.is_empty() {
            0
        } else {
            PacketHeader::SIZE + pcm_payload_len(wanted)
        };
        state.wanted_pcm = wanted;
        tracing::debug!(device = %self.addr, wanted = %wanted, "pcm recompute");
    }

    /// Channels currently exchanging PCM.
    #[must_use]
    pub fn wanted_pcm(&self) -> ChannelSet {
        self.lock().wanted_pcm
    }

    /// Wire length of this device's outbound PCM packet (0 when idle).
    #[must_use]
    pub fn pcm_wire_len(&self) -> usize {
        self.lock().pcm_wire_len
    }

    /// Set or clear the off-hook state of a channel.
    pub fn set_offhook(&self, channel: usize, on: bool) {
        self.lock().offhook.set(channel, on);
        self.pcm_recompute(ChannelSet::EMPTY);
    }

    /// Set or clear caller-id transmission on a channel.
    pub fn set_cid(&self, channel: usize, on: bool) {
        self.lock().cid_on.set(channel, on);
        self.pcm_recompute(ChannelSet::EMPTY);
    }

    /// Replace the digital-signalling channel set (D-channels carry no PCM).
    pub fn set_digital_signalling(&self, set: ChannelSet) {
        self.lock().digital_signalling = set;
        self.pcm_recompute(ChannelSet::EMPTY);
    }

    /// Replace the digital input/output channel sets.
    pub fn set_digital_io(&self, inputs: ChannelSet, outputs: ChannelSet) {
        {
            let mut state = self.lock();
            state.digital_inputs = inputs;
            state.digital_outputs = outputs;
        }
        self.pcm_recompute(ChannelSet::EMPTY);
    }

    /// Mute or unmute inbound audio on a channel (tone suppression).
    pub fn set_mute(&self, channel: usize, on: bool) {
        self.lock().mute.set(channel, on);
    }

    /// Request one tick of injected silence on a channel.
    ///
    /// The set clears itself at the end of the tick.
    pub fn request_silence(&self, channel: usize) {
        self.lock().silence.insert(channel);
    }

    /// Stage outbound audio for a channel.
    pub fn set_write_chunk(&self, channel: usize, chunk: Chunk) {
        if channel < self.channels {
            self.lock().write_chunks[channel] = chunk;
        }
    }

    /// Last received audio for a channel.
    #[must_use]
    pub fn read_chunk(&self, channel: usize) -> Chunk {
        if channel < self.channels {
            self.lock().read_chunks[channel]
        } else {
            SILENCE_CHUNK
        }
    }

    /// Copy staged write chunks into an outbound PCM payload.
    ///
    /// Channels without a present device stay at silence.
    pub fn fill_outbound_pcm(&self, channels: ChannelSet, slots: &mut PcmSlots<'_>) {
        let state = self.lock();
        let present = self.is_present();
        for ch in channels.iter() {
            if let Some(slot) = slots.chunk_mut(ch) {
                if present {
                    slot.copy_from_slice(&state.write_chunks[ch]);
                }
            }
        }
        self.counters.pcm_write.fetch_add(1, Ordering::Relaxed);
    }

    /// Apply one inbound PCM payload with mute/silence policy.
    ///
    /// Real audio lands only on wanted, unmuted channels; channels that are
    /// wanted-but-absent or marked for silence injection get a silence chunk.
    pub fn apply_inbound_pcm(&self, pcm: &PcmView<'_>) {
        let mut state = self.lock();
        let muted = !state.wanted_pcm | state.mute | state.silence;
        let silenced = state.wanted_pcm | state.silence;
        for ch in 0..self.channels {
            let got_data = pcm.channels().contains(ch);
            if got_data && !muted.contains(ch) {
                if let Some(chunk) = pcm.chunk(ch) {
                    state.read_chunks[ch].copy_from_slice(chunk);
                }
            } else if silenced.contains(ch) {
                state.read_chunks[ch] = SILENCE_CHUNK;
            }
        }
        self.counters.pcm_read.fetch_add(1, Ordering::Relaxed);
    }

    /// End-of-tick bookkeeping: clear the one-shot silence set and record
    /// the global counter value for watchdog purposes.
    pub fn end_of_tick(&self, global_counter: u64) {
        let mut state = self.lock();
        state.silence.clear();
        state.last_tick_counter = global_counter;
        drop(state);
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Global counter value at this device's last tick.
    #[must_use]
    pub fn last_tick_counter(&self) -> u64 {
        self.lock().last_tick_counter
    }

    /// Count one inbound validation failure.
    pub fn count_recv_error(&self) {
        self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Diagnostic snapshot.
    #[must_use]
    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            addr: self.addr,
            family: self.family.name(),
            channels: self.channels,
            timing_priority: self.timing_priority,
            present: self.is_present(),
            wanted_pcm: self.wanted_pcm(),
            pcm_write: self.counters.pcm_write.load(Ordering::Relaxed),
            pcm_read: self.counters.pcm_read.load(Ordering::Relaxed),
            recv_errors: self.counters.recv_errors.load(Ordering::Relaxed),
        }
    }
}
