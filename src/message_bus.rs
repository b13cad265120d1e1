//! Text messages between units
//!
//! Each unit registers a mailbox under its id. A sender blocks until
//! the addressed unit has processed the message and replied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use vtl_tape::message::{UnitMessage, REPLY_ERROR};
use vtl_tape::smc::DriveControl;

/// One message with the channel for its reply
pub struct Envelope {
    pub source: u64,
    pub text: String,
    reply: Sender<String>,
}

impl Envelope {
    pub fn reply(self, text: String) {
        // the sender may have timed out already
        let _ = self.reply.send(text);
    }
}

#[derive(Clone, Default)]
pub struct MessageBus {
    mailboxes: Arc<Mutex<HashMap<u64, Sender<Envelope>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the mailbox of unit `id`
    pub fn register(&self, id: u64) -> Result<Mailbox, Error> {
        let mut mailboxes = self.mailboxes.lock().unwrap();
        if mailboxes.contains_key(&id) {
            bail!("unit {} already has a mailbox", id);
        }
        let (sender, receiver) = unbounded();
        mailboxes.insert(id, sender);
        Ok(Mailbox {
            id,
            receiver,
            bus: self.clone(),
        })
    }

    /// Send `text` to unit `destination` and wait for the reply
    pub fn send_message(
        &self,
        source: u64,
        destination: u64,
        text: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        let sender = self
            .mailboxes
            .lock()
            .unwrap()
            .get(&destination)
            .cloned()
            .ok_or_else(|| format_err!("no unit {} on the message bus", destination))?;

        let (reply_tx, reply_rx) = bounded(1);
        let envelope = Envelope {
            source,
            text: text.to_string(),
            reply: reply_tx,
        };
        sender
            .send(envelope)
            .map_err(|_| format_err!("unit {} stopped", destination))?;

        log::debug!("message {} -> {}: '{}'", source, destination, text);

        reply_rx
            .recv_timeout(timeout)
            .map_err(|_| format_err!("no reply from unit {} within {:?}", destination, timeout))
    }
}

/// Receiving end of a unit, unregisters on drop
pub struct Mailbox {
    id: u64,
    receiver: Receiver<Envelope>,
    bus: MessageBus,
}

impl Mailbox {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next queued message, does not block
    pub fn try_receive(&self) -> Option<Envelope> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for a message
    pub fn receive_message(&self, timeout: Duration) -> Option<Envelope> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.bus.mailboxes.lock().unwrap().remove(&self.id);
    }
}

/// Library side drive control: load/unload requests over the bus
pub struct BusDriveControl {
    bus: MessageBus,
    library: u64,
    timeout: Duration,
}

impl BusDriveControl {
    pub fn new(bus: MessageBus, library: u64, timeout: Duration) -> Self {
        Self {
            bus,
            library,
            timeout,
        }
    }

    fn request(&self, drive: u64, message: UnitMessage) -> Result<(), Error> {
        let reply = self
            .bus
            .send_message(self.library, drive, &message.to_string(), self.timeout)?;
        if let Some(err) = reply.strip_prefix(REPLY_ERROR) {
            bail!("drive {} - {}", drive, err.trim());
        }
        Ok(())
    }
}

impl DriveControl for BusDriveControl {
    fn load(&mut self, drive: u64, barcode: &str) -> Result<(), Error> {
        self.request(drive, UnitMessage::Load(barcode.to_string()))
    }

    fn unload(&mut self, drive: u64) -> Result<(), Error> {
        self.request(drive, UnitMessage::Unload)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_reply() -> Result<(), Error> {
        let bus = MessageBus::new();
        let mailbox = bus.register(11)?;
        assert!(bus.register(11).is_err());

        let drive = std::thread::spawn(move || {
            for _ in 0..2 {
                let envelope = mailbox
                    .receive_message(Duration::from_secs(5))
                    .expect("message");
                let reply = match envelope.text.as_str() {
                    "lload E01001L6" => String::from("loaded E01001L6"),
                    _ => format!("{} busy", REPLY_ERROR),
                };
                envelope.reply(reply);
            }
        });

        let mut control = BusDriveControl::new(bus.clone(), 10, Duration::from_secs(5));
        control.load(11, "E01001L6")?;
        let err = control.unload(11).unwrap_err();
        assert_eq!(err.to_string(), "drive 11 - busy");

        drive.join().unwrap();

        // the mailbox is gone with its unit
        assert!(bus
            .send_message(10, 11, "unload", Duration::from_millis(10))
            .is_err());
        Ok(())
    }
}
