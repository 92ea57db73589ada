//! Card-family behavior hooks.
//!
//! A card family supplies the per-card-type logic the engine calls during
//! the tick sequence. The engine never holds a device lock while invoking
//! a family callback, so callbacks are free to call back into the device.

use std::fmt::Debug;

use crate::bus::Device;
use crate::frame::{PcmSlots, PcmView};
use crate::types::ChannelSet;

/// Per-card-type callbacks, one implementation shared by all devices of
/// that family.
pub trait CardFamily: Send + Sync + Debug {
    /// Family name for diagnostics ("generic", "fxs", "fxo", ...).
    fn name(&self) -> &'static str;

    /// Fill the host-to-device PCM slots for one tick.
    ///
    /// `slots` arrives silence-filled with one slot per channel in
    /// `channels`; overwrite the slots that carry real audio.
    fn pcm_from_host(&self, device: &Device, channels: ChannelSet, slots: &mut PcmSlots<'_>);

    /// Deliver one validated device-to-host PCM payload.
    fn pcm_to_host(&self, device: &Device, pcm: &PcmView<'_>);

    /// Per-tick callback, invoked after PCM has moved in both directions.
    fn tick(&self, device: &Device) {
        let _ = device;
    }

    /// Asynchronous register acknowledgement addressed to `device`.
    fn register_reply(&self, device: &Device, payload: &[u8]) {
        tracing::trace!(device = %device.addr(), len = payload.len(), "register reply");
    }
}

/// Analog-style family: copies the device's staged write chunks out and
/// applies mute/silence policy on the way in.
#[derive(Debug, Default)]
pub struct GenericFamily;

impl CardFamily for GenericFamily {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn pcm_from_host(&self, device: &Device, channels: ChannelSet, slots: &mut PcmSlots<'_>) {
        device.fill_outbound_pcm(channels, slots);
    }

    fn pcm_to_host(&self, device: &Device, pcm: &PcmView<'_>) {
        device.apply_inbound_pcm(pcm);
    }
}
