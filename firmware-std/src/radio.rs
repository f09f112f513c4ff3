/// ESP-NOW radio backed by the ESP-IDF driver.
use esp_idf_svc::espnow::{EspNow, PeerInfo, ReceiveInfo};
use esp_idf_svc::sys::{
    wifi_interface_t_WIFI_IF_STA, EspError, ESP_ERR_ESPNOW_NOT_FOUND, ESP_ERR_ESPNOW_NO_MEM,
};

use espnow_ble_proxy::comm::{Radio, RadioError};
use espnow_ble_proxy::mac::MacAddress;

pub struct EspNowRadio {
    espnow: EspNow<'static>,
}

impl EspNowRadio {
    pub fn new(espnow: EspNow<'static>) -> Self {
        Self { espnow }
    }
}

/// Send-queue exhaustion and missing peers get their own variants; anything
/// else is reported as a raw driver code.
fn map_err(e: EspError) -> RadioError {
    let code = e.code();
    if code == ESP_ERR_ESPNOW_NO_MEM as i32 {
        RadioError::QueueFull
    } else if code == ESP_ERR_ESPNOW_NOT_FOUND as i32 {
        RadioError::UnknownPeer
    } else {
        RadioError::Driver(code)
    }
}

impl Radio for EspNowRadio {
    fn add_peer(&mut self, peer: &MacAddress) -> Result<(), RadioError> {
        let info = PeerInfo {
            peer_addr: peer.0,
            channel: 0,
            ifidx: wifi_interface_t_WIFI_IF_STA,
            encrypt: false,
            ..Default::default()
        };
        self.espnow.add_peer(info).map_err(map_err)
    }

    fn transmit(&mut self, peer: &MacAddress, frame: &[u8]) -> Result<(), RadioError> {
        self.espnow.send(peer.0, frame).map_err(map_err)
    }

    fn set_receive_callback<F>(&mut self, mut callback: F) -> Result<(), RadioError>
    where
        F: FnMut(&MacAddress, &[u8]) + Send + 'static,
    {
        self.espnow
            .register_recv_cb(move |info: &ReceiveInfo, data: &[u8]| {
                callback(&MacAddress(*info.src_addr), data);
            })
            .map_err(map_err)
    }
}
