//! Transcoding for finished recordings

pub mod ffmpeg;

pub use ffmpeg::{
    build_ffmpeg_command, run_transcode, transcode_timeout, TranscodeError, TranscodeParams,
};
