pub mod audio;
pub mod background_thread;
pub mod data_channels;
pub mod data_types;
pub mod events;
pub mod media;
pub mod presence;
pub mod state_store;
pub mod transport;
pub mod webrtc_transport;

#[cfg(test)]
pub mod test_support;
