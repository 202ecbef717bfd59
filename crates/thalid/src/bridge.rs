//! Placeholder native bridge for platforms without a mobile radio.
//!
//! The real bridges live in the platform projects and speak to Bluetooth
//! or Multipeer Connectivity hardware. On a desktop node there is no
//! such radio, so every operation reports the radio as off and no events
//! are ever delivered. Discovery still works over Wi-Fi SSDP.

use thali_discovery::{NativeBridge, TransportError};

pub struct DisabledBridge;

impl NativeBridge for DisabledBridge {
    fn start_advertising_and_listening(&self) -> Result<(), TransportError> {
        Err(TransportError::RadioTurnedOff)
    }

    fn stop_advertising_and_listening(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn start_listening_for_advertisements(&self) -> Result<(), TransportError> {
        Err(TransportError::RadioTurnedOff)
    }

    fn stop_listening_for_advertisements(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn connect(&self, _peer_identifier: &str) -> Result<u16, TransportError> {
        Err(TransportError::RadioTurnedOff)
    }
}
