//! Abstraction over "a handle frames are written to", so the ARP sender
//! and sniffer can be exercised without a real interface.

use std::sync::Mutex;

use eavesarp_core::error::{Error, Result};

/// Something a serialised Ethernet frame can be written to.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &[u8]) -> Result<()>;
}

/// Writes frames out a real link-layer interface via `pnet_datalink`.
pub struct PnetFrameSink {
    tx: Mutex<Box<dyn pnet_datalink::DataLinkSender>>,
}

impl PnetFrameSink {
    pub fn new(tx: Box<dyn pnet_datalink::DataLinkSender>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl FrameSink for PnetFrameSink {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let mut tx = self.tx.lock().expect("frame sink mutex poisoned");
        match tx.send_to(frame, None) {
            Some(res) => res.map_err(Error::Io),
            None => Err(Error::Io(std::io::Error::other("datalink sender buffer full"))),
        }
    }
}

/// Records every frame written to it; used by sender/sniffer tests.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: Mutex<Vec<Vec<u8>>>,
}

impl FrameSink for RecordingSink {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.frames.lock().expect("recording sink mutex poisoned").push(frame.to_vec());
        Ok(())
    }
}
