//! Microphone capture and the immutable samples it produces.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod microphone;
pub mod recorder;
pub mod sample;
pub mod wav;
