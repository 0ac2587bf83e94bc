//! Audio file I/O and the soft-real-time player loop.

mod player;
mod sink;
mod source;

pub use self::{
    player::Player,
    sink::{open_sink, AudioSink, RawSink, WavSink},
    source::{SampleSource, ToneSource, WavSource},
};
