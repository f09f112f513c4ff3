//! Host-side doubles for the platform seams.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use crate::comm::{Radio, RadioError};
use crate::mac::MacAddress;
use crate::scanner::{Advertisement, BatteryPercent, CentiCelsius, Measurement, SensorDecoder};

type Callback = Box<dyn FnMut(&MacAddress, &[u8]) + Send>;

#[derive(Default)]
struct RadioState {
    peers: Vec<MacAddress>,
    sent: Vec<(MacAddress, Vec<u8>)>,
    transmit_failures: VecDeque<RadioError>,
    add_peer_failure: Option<RadioError>,
    callback: Option<Callback>,
}

/// Scripted radio. Clones share state so a test can keep a handle after
/// moving the radio into a transport.
#[derive(Clone, Default)]
pub struct MockRadio {
    state: Rc<RefCell<RadioState>>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(MacAddress, Vec<u8>)> {
        self.state.borrow().sent.clone()
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state
            .borrow()
            .sent
            .iter()
            .map(|(_, f)| f.clone())
            .collect()
    }

    pub fn peers(&self) -> Vec<MacAddress> {
        self.state.borrow().peers.clone()
    }

    pub fn fail_add_peer(&self, err: RadioError) {
        self.state.borrow_mut().add_peer_failure = Some(err);
    }

    /// Queue a failure for the next transmit call
    pub fn fail_next_transmit(&self, err: RadioError) {
        self.state.borrow_mut().transmit_failures.push_back(err);
    }

    /// Simulate a frame arriving over the air
    pub fn deliver(&self, src: &MacAddress, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        if let Some(cb) = state.callback.as_mut() {
            cb(src, data);
        }
    }
}

impl Radio for MockRadio {
    fn add_peer(&mut self, peer: &MacAddress) -> Result<(), RadioError> {
        let mut state = self.state.borrow_mut();
        if let Some(err) = state.add_peer_failure {
            return Err(err);
        }
        state.peers.push(*peer);
        Ok(())
    }

    fn transmit(&mut self, peer: &MacAddress, frame: &[u8]) -> Result<(), RadioError> {
        let mut state = self.state.borrow_mut();
        if let Some(err) = state.transmit_failures.pop_front() {
            return Err(err);
        }
        if !state.peers.contains(peer) {
            return Err(RadioError::UnknownPeer);
        }
        state.sent.push((*peer, frame.to_vec()));
        Ok(())
    }

    fn set_receive_callback<F>(&mut self, callback: F) -> Result<(), RadioError>
    where
        F: FnMut(&MacAddress, &[u8]) + Send + 'static,
    {
        self.state.borrow_mut().callback = Some(Box::new(callback));
        Ok(())
    }
}

/// Marker byte [`FakeDecoder`] recognizes
pub const FAKE_SENSOR_MARKER: u8 = 0xA5;

/// Recognizes payloads `[0xA5, temp_lo, temp_hi, battery]`.
pub struct FakeDecoder;

impl SensorDecoder for FakeDecoder {
    fn decode(&self, adv: &Advertisement) -> Option<Measurement> {
        match adv.payload.as_slice() {
            [FAKE_SENSOR_MARKER, lo, hi, battery] => Some(Measurement {
                temperature: Some(CentiCelsius(i16::from_le_bytes([*lo, *hi]))),
                humidity: None,
                battery: Some(BatteryPercent(*battery)),
            }),
            _ => None,
        }
    }
}

/// Payload [`FakeDecoder`] decodes to the given values
pub fn sensor_payload(centi_celsius: i16, battery: u8) -> [u8; 4] {
    let t = centi_celsius.to_le_bytes();
    [FAKE_SENSOR_MARKER, t[0], t[1], battery]
}
