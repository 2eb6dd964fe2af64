//! Audio codec and playback buffering.

pub mod codec;
pub mod playback;

pub use codec::{
    decode_inbound, decode_pcm, encode_outbound, encode_outbound_at, rms_level, PlayableBuffer,
    WireFrame, PLAYBACK_SAMPLE_RATE, WIRE_SAMPLE_RATE,
};
pub use playback::{AudioOutput, PlaybackQueue, ScheduledBuffer};
